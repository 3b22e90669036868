use rusqlite_migration::{Migrations, M};

/// Schema of the database, versioned with `user_version`.
///
/// Append new migrations; never edit one that has shipped.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        "CREATE TABLE buckets (
    name TEXT PRIMARY KEY,
    sequence INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE entries (
    bucket TEXT NOT NULL REFERENCES buckets(name),
    key BLOB NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (bucket, key)
) WITHOUT ROWID;",
    )])
}
