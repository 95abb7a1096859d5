use regex::Regex;

/// Short display name for a type, with module paths stripped, used to label
/// capability contracts in errors and logs.
pub fn short_name<T: ?Sized>() -> String {
    abs_to_rel_paths(std::any::type_name::<T>())
}

fn abs_to_rel_paths(s: &str) -> String {
    let re = Regex::new("[_a-zA-Z0-9]*::").unwrap();
    re.replace_all(s, "").into()
}

/// Collapse a SQL statement to a single log line: newlines become spaces,
/// tabs, carriage returns and NUL bytes are stripped.
pub fn normalize_statement(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    for c in sql.chars() {
        match c {
            '\n' => out.push(' '),
            '\t' | '\r' | '\0' => {}
            c => out.push(c),
        }
    }
    out
}
