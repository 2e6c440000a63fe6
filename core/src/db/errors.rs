use sqlx::Error as SqlxError;

const POSTGRES_UNDEFINED_TABLE: &str = "42P01";

/// Returns `true` if the error is Postgres signalling that a relation does
/// not exist. Schema version probing relies on this.
pub fn is_undefined_table(err: &SqlxError) -> bool {
    match err {
        SqlxError::Database(db_err) => db_err
            .code()
            .map(|code| code.as_ref() == POSTGRES_UNDEFINED_TABLE)
            .unwrap_or(false),
        _ => false,
    }
}
