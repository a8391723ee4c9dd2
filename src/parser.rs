use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Statement verb reported back to callers as `command`.
///
/// Statements the parser understands are classified by kind, so CTEs and
/// `VALUES` lists report `SELECT` the way Postgres tags them. Anything else
/// falls back to the leading keyword of the text.
pub fn command_tag(sql: &str) -> String {
    Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .ok()
        .and_then(|statements| statements.first().and_then(statement_verb))
        .map(str::to_string)
        .unwrap_or_else(|| leading_keyword(sql))
}

fn statement_verb(statement: &Statement) -> Option<&'static str> {
    let verb = match statement {
        Statement::Query(_) => "SELECT",
        Statement::Insert(_) => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete(_) => "DELETE",
        _ => return None,
    };
    Some(verb)
}

fn leading_keyword(sql: &str) -> String {
    sql.trim_start_matches(|c: char| c.is_whitespace() || c == '(')
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase()
}
