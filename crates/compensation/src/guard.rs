//! Inverse statement guard
//!
//! Native-query compensation executes caller-supplied SQL, so the text is
//! screened before it goes anywhere near a store. Parameters are bound
//! positionally by the datasource; the guard only has to reject statement
//! shapes that should never appear in an inverse: anything that is not
//! plain DML or a procedure call, anything carrying schema-modifying
//! keywords, and anything smuggling a second statement.

const ALLOWED_PREFIXES: [&str; 4] = ["UPDATE", "INSERT", "DELETE", "CALL"];

const FORBIDDEN_KEYWORDS: [&str; 7] = [
    "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE", "RENAME",
];

/// Screen an inverse statement.
///
/// Accepted statements begin with UPDATE, INSERT, DELETE, or CALL, contain
/// exactly one statement, and carry no schema-modifying keywords.
pub fn validate_inverse_statement(statement: &str) -> Result<(), String> {
    let trimmed = statement.trim();
    if trimmed.is_empty() {
        return Err("inverse statement is empty".to_string());
    }
    if trimmed.contains(';') {
        return Err("inverse statement must be a single statement".to_string());
    }

    let first_word = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if !ALLOWED_PREFIXES.contains(&first_word.as_str()) {
        return Err(format!(
            "inverse statement must begin with UPDATE, INSERT, DELETE, or CALL; got '{}'",
            first_word
        ));
    }

    for word in words_of(trimmed) {
        if FORBIDDEN_KEYWORDS.contains(&word.to_ascii_uppercase().as_str()) {
            return Err(format!(
                "inverse statement contains forbidden keyword '{}'",
                word.to_ascii_uppercase()
            ));
        }
    }
    Ok(())
}

/// Screen a procedure name: dot-separated identifiers, each starting with
/// a letter or underscore and containing only letters, digits, and
/// underscores.
pub fn validate_procedure_name(name: &str) -> Result<(), String> {
    if name.is_empty() || name.len() > 128 {
        return Err("procedure name must be 1 to 128 characters".to_string());
    }
    for segment in name.split('.') {
        let mut chars = segment.chars();
        let valid_head = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        if !valid_head || !segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("invalid procedure name '{}'", name));
        }
    }
    Ok(())
}

fn words_of(statement: &str) -> impl Iterator<Item = &str> {
    statement
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
}
