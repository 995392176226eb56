//! Policy file loading and validation.
//!
//! Validation is all-or-nothing: a bad version, a nameless rule, a duplicate
//! name, a rule without `match.method`, or a regex that fails to compile
//! rejects the whole file. Regex compilation happens again in the engine when
//! the rule set is compiled; validating here keeps load failures fatal at
//! startup rather than surfacing mid-evaluation.

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;

use super::{PolicyError, PolicyFile};

/// Read and validate a YAML policy file from disk.
pub fn load_file(path: &Path) -> Result<PolicyFile, PolicyError> {
    let data = std::fs::read(path).map_err(|source| PolicyError::Read {
        path: path.display().to_string(),
        source,
    })?;
    load_bytes(&data)
}

/// Parse and validate YAML policy data.
pub fn load_bytes(data: &[u8]) -> Result<PolicyFile, PolicyError> {
    let file: PolicyFile = serde_yaml::from_slice(data)?;
    validate(&file)?;
    Ok(file)
}

fn validate(file: &PolicyFile) -> Result<(), PolicyError> {
    if file.version != 1 {
        return Err(PolicyError::UnsupportedVersion {
            found: file.version,
        });
    }

    let mut seen = HashSet::new();
    for (index, rule) in file.rules.iter().enumerate() {
        if rule.name.is_empty() {
            return Err(PolicyError::MissingRuleName { index });
        }
        if !seen.insert(rule.name.as_str()) {
            return Err(PolicyError::DuplicateRuleName {
                name: rule.name.clone(),
            });
        }
        if rule.matcher.method.is_empty() {
            return Err(PolicyError::MissingMatchMethod {
                rule: rule.name.clone(),
            });
        }
        for (key, arg) in &rule.matcher.arguments {
            if !arg.regex.is_empty() {
                Regex::new(&arg.regex).map_err(|source| PolicyError::InvalidRegex {
                    rule: rule.name.clone(),
                    key: key.clone(),
                    source,
                })?;
            }
        }
    }

    Ok(())
}
