//! Support for `-c key=value` overrides on top of `dispatch.toml`.
//!
//! This mirrors the configuration-tree the daemon loads at startup: a
//! [`CliConfigOverrides`] can be embedded into a `clap`-derived CLI struct
//! with `#[command(flatten)]`. Each occurrence of `-c key=value` is kept
//! unparsed so the caller decides how to interpret the right-hand side.

use clap::ArgAction;
use clap::Parser;
use serde_json::Value;

#[derive(Parser, Debug, Default, Clone)]
pub struct CliConfigOverrides {
    /// Override a configuration value that would otherwise come from
    /// `dispatch.toml`. Use a dotted path (`foo.bar`) for nested values.
    /// The right-hand side is parsed as JSON; if that fails, the raw string
    /// is used as a literal.
    ///
    /// Examples:
    ///   - `-c listenPort=9091`
    ///   - `-c adapterStartTimeoutMs=60000`
    #[arg(
        short = 'c',
        long = "config",
        value_name = "key=value",
        action = ArgAction::Append,
        global = true,
    )]
    pub raw_overrides: Vec<String>,
}

impl CliConfigOverrides {
    pub fn parse_overrides(&self) -> Result<Vec<(String, Value)>, String> {
        self.raw_overrides
            .iter()
            .map(|s| {
                let mut parts = s.splitn(2, '=');
                let key = match parts.next() {
                    Some(k) => k.trim(),
                    None => return Err("override missing key".to_string()),
                };
                let value_str = parts
                    .next()
                    .ok_or_else(|| format!("invalid override (missing '='): {s}"))?
                    .trim();

                if key.is_empty() {
                    return Err(format!("empty key in override: {s}"));
                }

                let value: Value = match serde_json::from_str(value_str) {
                    Ok(v) => v,
                    Err(_) => Value::String(value_str.to_string()),
                };

                Ok((key.to_string(), value))
            })
            .collect()
    }

    pub fn apply_on_value(&self, target: &mut Value) -> Result<(), String> {
        let overrides = self.parse_overrides()?;
        for (path, value) in overrides {
            apply_single_override(target, &path, value);
        }
        Ok(())
    }
}

fn apply_single_override(root: &mut Value, path: &str, value: Value) {
    use serde_json::Map;

    let parts: Vec<&str> = path.split('.').collect();
    let mut current = root;

    for (i, part) in parts.iter().enumerate() {
        let is_last = i == parts.len() - 1;

        if is_last {
            if let Value::Object(obj) = current {
                obj.insert(part.to_string(), value);
            } else {
                *current = Value::Object({
                    let mut m = Map::new();
                    m.insert(part.to_string(), value);
                    m
                });
            }
            return;
        }

        match current {
            Value::Object(obj) => {
                current = obj
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            _ => {
                *current = Value::Object(Map::new());
                if let Value::Object(obj) = current {
                    current = obj
                        .entry((*part).to_string())
                        .or_insert_with(|| Value::Object(Map::new()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn applies_dotted_path_override() {
        let overrides = CliConfigOverrides {
            raw_overrides: vec!["tlsConfig.certPath=/etc/dispatch/cert.pem".to_string()],
        };
        let mut target = serde_json::json!({"listenPort": 9090});
        overrides.apply_on_value(&mut target).expect("applies");
        assert_eq!(target["tlsConfig"]["certPath"], "/etc/dispatch/cert.pem");
        assert_eq!(target["listenPort"], 9090);
    }

    #[test]
    fn non_json_value_falls_back_to_string() {
        let overrides = CliConfigOverrides {
            raw_overrides: vec!["workspacesRoot=/home/user/work".to_string()],
        };
        let mut target = serde_json::json!({});
        overrides.apply_on_value(&mut target).expect("applies");
        assert_eq!(target["workspacesRoot"], "/home/user/work");
    }
}
