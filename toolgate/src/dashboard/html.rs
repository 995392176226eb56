//! Minimal HTML rendering for the dashboard pages.

use toolgate_core::approval::ApprovalRequest;
use toolgate_core::audit::{AuditRecord, AuditStats};

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>{title} - toolgate</title>
<style>
body {{ font-family: ui-monospace, monospace; margin: 2rem; background: #111; color: #ddd; }}
a {{ color: #7ab8ff; margin-right: 1rem; }}
table {{ border-collapse: collapse; width: 100%; margin-top: 1rem; }}
th, td {{ text-align: left; padding: 0.3rem 0.6rem; border-bottom: 1px solid #333; }}
.verdict-allow {{ color: #7fd787; }}
.verdict-deny {{ color: #ff6b6b; }}
.verdict-ask {{ color: #f0c674; }}
.verdict-log {{ color: #7ab8ff; }}
pre {{ background: #1a1a1a; padding: 1rem; overflow-x: auto; }}
button {{ margin-right: 0.4rem; }}
</style>
</head>
<body>
<nav>
<a href="/">overview</a><a href="/audit">audit</a><a href="/approval">approval</a><a href="/policy">policy</a>
</nav>
<h1>{title}</h1>
{body}
</body>
</html>"#
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max).collect();
        format!("{head}...")
    } else {
        s.to_string()
    }
}

pub fn overview(stats: &AuditStats) -> String {
    let body = format!(
        r#"<table>
<tr><th>total</th><th class="verdict-allow">allow</th><th class="verdict-deny">deny</th><th class="verdict-ask">ask</th><th class="verdict-log">log</th></tr>
<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>
</table>"#,
        stats.total_requests,
        stats.allow_count,
        stats.deny_count,
        stats.ask_count,
        stats.log_count,
    );
    layout("overview", &body)
}

pub fn audit(records: &[AuditRecord]) -> String {
    let mut rows = String::new();
    for record in records {
        let arguments = record
            .arguments
            .as_ref()
            .map(|a| truncate(&a.to_string(), 80))
            .unwrap_or_default();
        rows.push_str(&format!(
            r#"<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td class="verdict-{}">{}</td><td>{}</td></tr>"#,
            record.timestamp.to_rfc3339(),
            escape(&record.method),
            escape(&record.tool),
            escape(&arguments),
            record.verdict,
            record.verdict,
            escape(&record.rule),
        ));
    }
    let body = format!(
        r#"<table>
<tr><th>time</th><th>method</th><th>tool</th><th>arguments</th><th>verdict</th><th>rule</th></tr>
{rows}</table>"#
    );
    layout("audit", &body)
}

pub fn approval(pending: &[ApprovalRequest], all: &[ApprovalRequest]) -> String {
    let mut body = String::from("<h2>pending</h2><table><tr><th>id</th><th>tool</th><th>rule</th><th>actions</th></tr>");
    for request in pending {
        body.push_str(&format!(
            r#"<tr><td>{id}</td><td>{tool}</td><td>{rule}</td><td>
<form method="post" action="/approval/{id}/approve" style="display:inline"><button>approve</button></form>
<form method="post" action="/approval/{id}/deny" style="display:inline"><button>deny</button></form>
</td></tr>"#,
            id = escape(&request.id),
            tool = escape(&request.tool),
            rule = escape(&request.rule),
        ));
    }
    body.push_str("</table><h2>history</h2><table><tr><th>id</th><th>tool</th><th>rule</th><th>status</th></tr>");
    for request in all {
        body.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{:?}</td></tr>",
            escape(&request.id),
            escape(&request.tool),
            escape(&request.rule),
            request.status,
        ));
    }
    body.push_str("</table>");
    layout("approval", &body)
}

pub fn policy(source: &str) -> String {
    layout("policy", &format!("<pre>{}</pre>", escape(source)))
}
