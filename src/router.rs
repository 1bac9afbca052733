//! Statement classification.
//!
//! The routing rule is purely lexical: the first keyword decides whether a
//! statement goes to the reader or fans out to the writers. Anything that is
//! not obviously a read is a write, so CTEs and compound statements always
//! take the write path.

/// Where a statement is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryClass {
    /// Dispatched to the single reader endpoint.
    Read,
    /// Fanned out to every writer endpoint.
    Write,
}

impl QueryClass {
    pub fn is_read(self) -> bool {
        self == QueryClass::Read
    }
}

const READ_KEYWORDS: [&str; 3] = ["SELECT", "SHOW", "EXPLAIN"];

/// Classify a statement by its first keyword, case-insensitive.
///
/// The empty statement classifies as a write; routing an unknown shape to
/// the writers keeps the reader free of accidental mutations.
pub fn classify(sql: &str) -> QueryClass {
    let trimmed = sql.trim_start();
    let keyword_len = trimmed
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let keyword = &trimmed[..keyword_len];

    if READ_KEYWORDS
        .iter()
        .any(|candidate| keyword.eq_ignore_ascii_case(candidate))
    {
        QueryClass::Read
    } else {
        QueryClass::Write
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_classify_reads() {
        assert_eq!(classify("SELECT 1"), QueryClass::Read);
        assert_eq!(classify("  seLECT * FROM t"), QueryClass::Read);
        assert_eq!(classify("\n\tselect now()"), QueryClass::Read);
        assert_eq!(classify("SHOW server_version"), QueryClass::Read);
        assert_eq!(classify("EXPLAIN SELECT 1"), QueryClass::Read);
        assert_eq!(classify("explain analyze select 1"), QueryClass::Read);
    }

    #[test]
    fn test_classify_writes() {
        assert_eq!(classify("INSERT INTO t VALUES (1)"), QueryClass::Write);
        assert_eq!(classify("UPDATE t SET a = 1"), QueryClass::Write);
        assert_eq!(classify("DELETE FROM t"), QueryClass::Write);
        assert_eq!(classify("CREATE TABLE t (a int)"), QueryClass::Write);
        assert_eq!(classify("BEGIN"), QueryClass::Write);
    }

    #[test]
    fn test_classify_cte_is_write() {
        assert_eq!(
            classify("WITH x AS (SELECT 1) INSERT INTO t SELECT * FROM x"),
            QueryClass::Write
        );
        // even a pure read behind a CTE takes the write path by rule
        assert_eq!(classify("WITH x AS (SELECT 1) SELECT * FROM x"), QueryClass::Write);
    }

    #[test]
    fn test_classify_empty_is_write() {
        assert_eq!(classify(""), QueryClass::Write);
        assert_eq!(classify("   "), QueryClass::Write);
    }

    #[test]
    fn test_classify_keyword_requires_boundary() {
        // SELECTION is not SELECT
        assert_eq!(classify("SELECTION"), QueryClass::Write);
        assert_eq!(classify("SELECT(1)"), QueryClass::Read);
    }
}
