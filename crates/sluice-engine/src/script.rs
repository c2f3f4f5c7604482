//! Line-oriented record scripts run by `script` hook actions.
//!
//! ```text
//! # comments start with '#'
//! set status = "active"
//! set source = $args.source
//! rename email -> contact
//! remove internal_id
//! keep country == "NL"
//! drop test exists
//! fail "unexpected batch"
//! ```
//!
//! Statements apply to the whole batch, top to bottom.

use serde_json::Value;

use sluice_core::error::{Result, SluiceError};
use sluice_core::expr::{literal, Condition};
use sluice_core::types::Record;

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Literal(Value),
    Arg(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Statement {
    Set { field: String, value: Operand },
    Remove { field: String },
    Rename { from: String, to: String },
    Keep(Condition),
    Drop(Condition),
    Fail(String),
}

/// A parsed script.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    statements: Vec<(usize, Statement)>,
}

fn script_err(line: usize, message: impl Into<String>) -> SluiceError {
    SluiceError::Script {
        line,
        message: message.into(),
    }
}

fn field(line: usize, raw: &str) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(script_err(line, format!("invalid field name '{name}'")));
    }
    Ok(name.to_string())
}

fn parse_line(line: usize, text: &str) -> Result<Statement> {
    let (keyword, rest) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
    let rest = rest.trim();
    match keyword {
        "set" => {
            let (name, value) = rest
                .split_once('=')
                .ok_or_else(|| script_err(line, "expected `set <field> = <value>`"))?;
            let value = value.trim();
            if value.is_empty() {
                return Err(script_err(line, "missing value"));
            }
            let value = match value.strip_prefix("$args.") {
                Some(arg) => Operand::Arg(field(line, arg)?),
                None => Operand::Literal(literal(value)),
            };
            Ok(Statement::Set {
                field: field(line, name)?,
                value,
            })
        }
        "remove" => Ok(Statement::Remove {
            field: field(line, rest)?,
        }),
        "rename" => {
            let (from, to) = rest
                .split_once("->")
                .ok_or_else(|| script_err(line, "expected `rename <from> -> <to>`"))?;
            Ok(Statement::Rename {
                from: field(line, from)?,
                to: field(line, to)?,
            })
        }
        "keep" | "drop" => {
            let condition = Condition::parse(rest).map_err(|e| script_err(line, e.to_string()))?;
            Ok(if keyword == "keep" {
                Statement::Keep(condition)
            } else {
                Statement::Drop(condition)
            })
        }
        "fail" => {
            let message = match literal(rest) {
                Value::String(s) => s,
                other => other.to_string(),
            };
            Ok(Statement::Fail(message))
        }
        other => Err(script_err(line, format!("unknown statement '{other}'"))),
    }
}

impl Script {
    pub fn parse(code: &str) -> Result<Self> {
        let mut statements = Vec::new();
        for (idx, raw) in code.lines().enumerate() {
            let text = raw.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            statements.push((idx + 1, parse_line(idx + 1, text)?));
        }
        Ok(Self { statements })
    }

    pub fn run(&self, mut records: Vec<Record>, args: &Value) -> Result<Vec<Record>> {
        for (line, statement) in &self.statements {
            match statement {
                Statement::Set { field, value } => {
                    let value = match value {
                        Operand::Literal(v) => v.clone(),
                        Operand::Arg(name) => args
                            .get(name)
                            .cloned()
                            .ok_or_else(|| script_err(*line, format!("missing argument '{name}'")))?,
                    };
                    for record in &mut records {
                        record.insert(field.clone(), value.clone());
                    }
                }
                Statement::Remove { field } => {
                    for record in &mut records {
                        record.retain(|k, _| k != field);
                    }
                }
                Statement::Rename { from, to } => {
                    // The renamed value replaces any existing `to` and sits
                    // where `from` was.
                    for record in &mut records {
                        if record.contains_key(from) && from != to {
                            *record = std::mem::take(record)
                                .into_iter()
                                .filter(|(k, _)| k != to)
                                .map(|(k, v)| if &k == from { (to.clone(), v) } else { (k, v) })
                                .collect();
                        }
                    }
                }
                Statement::Keep(condition) => records.retain(|r| condition.matches(r)),
                Statement::Drop(condition) => records.retain(|r| !condition.matches(r)),
                Statement::Fail(message) => return Err(script_err(*line, message.clone())),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn statements_apply_in_order() {
        let script = Script::parse(
            r#"
            # normalise
            set source = $args.source
            rename email -> contact
            remove internal
            drop test exists
            keep country == "NL"
            "#,
        )
        .unwrap();
        let input = vec![
            rec(json!({"email": "a@b", "internal": 1, "country": "NL"})),
            rec(json!({"email": "c@d", "country": "DE"})),
            rec(json!({"email": "e@f", "country": "NL", "test": true})),
        ];

        let out = script.run(input, &json!({"source": "crm"})).unwrap();
        assert_eq!(
            out,
            vec![rec(json!({"contact": "a@b", "country": "NL", "source": "crm"}))]
        );
    }

    #[test]
    fn rename_onto_existing_field_takes_the_source_slot() {
        let record = || rec(json!({"a": 1, "b": 2, "c": 3}));

        let out = Script::parse("rename c -> a").unwrap().run(vec![record()], &Value::Null).unwrap();
        assert_eq!(out[0].keys().collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(out[0]["a"], json!(3));

        let out = Script::parse("rename a -> c").unwrap().run(vec![record()], &Value::Null).unwrap();
        assert_eq!(out[0].keys().collect::<Vec<_>>(), vec!["c", "b"]);
        assert_eq!(out[0]["c"], json!(1));
    }

    #[test]
    fn fail_reports_line() {
        let script = Script::parse("set a = 1\nfail \"bad batch\"").unwrap();
        match script.run(vec![], &Value::Null) {
            Err(SluiceError::Script { line, message }) => {
                assert_eq!(line, 2);
                assert_eq!(message, "bad batch");
            }
            other => panic!("expected script error, got {other:?}"),
        }
    }

    #[test]
    fn missing_argument_is_an_error() {
        let script = Script::parse("set a = $args.nope").unwrap();
        assert!(script.run(vec![rec(json!({}))], &json!({})).is_err());
    }

    #[test]
    fn parse_errors_carry_line_numbers() {
        let err = Script::parse("set a = 1\n\nexplode now").unwrap_err();
        assert!(matches!(err, SluiceError::Script { line: 3, .. }));
        assert!(Script::parse("rename a b").is_err());
        assert!(Script::parse("keep").is_err());
    }
}
