//! SQL execution boundary and numbered migration files.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::core::path::safe_join;

static MIGRATION_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})_.*\.sql$").unwrap());

/// Runs SQL against the project's configured database integration.
pub trait SqlExecutor: Send + Sync {
    fn execute(&self, sql: &str) -> Result<()>;
}

/// Write `sql` as the next numbered migration; returns its project-relative path.
pub fn write_migration(
    root: &Path,
    migrations_dir: &str,
    description: Option<&str>,
    sql: &str,
) -> Result<String> {
    let dir = safe_join(root, migrations_dir)?;
    fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
    let number = next_migration_number(&dir)?;
    let slug = description.map(slugify).filter(|s| !s.is_empty());
    let name = format!("{number:04}_{}.sql", slug.as_deref().unwrap_or("migration"));
    let path = dir.join(&name);
    fs::write(&path, sql).with_context(|| format!("write {}", path.display()))?;
    Ok(format!("{}/{name}", migrations_dir.trim_end_matches('/')))
}

fn next_migration_number(dir: &Path) -> Result<u32> {
    let mut highest: Option<u32> = None;
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let name = entry.file_name();
        let Some(caps) = name.to_str().and_then(|n| MIGRATION_NUMBER_RE.captures(n)) else {
            continue;
        };
        if let Ok(n) = caps[1].parse::<u32>() {
            highest = Some(highest.map_or(n, |h| h.max(n)));
        }
    }
    Ok(highest.map_or(0, |h| h + 1))
}

fn slugify(text: &str) -> String {
    let mut slug = String::new();
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('_') {
            slug.push('_');
        }
    }
    let mut slug = slug.trim_end_matches('_').to_string();
    slug.truncate(60);
    slug.trim_end_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_migrations_sequentially() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = write_migration(
            temp.path(),
            "supabase/migrations",
            Some("Create users table"),
            "CREATE TABLE users (id serial primary key);",
        )
        .expect("write");
        assert_eq!(first, "supabase/migrations/0000_create_users_table.sql");
        assert_eq!(
            fs::read_to_string(temp.path().join(&first)).expect("read"),
            "CREATE TABLE users (id serial primary key);"
        );

        let second = write_migration(temp.path(), "supabase/migrations", None, "DROP TABLE users;")
            .expect("write");
        assert_eq!(second, "supabase/migrations/0001_migration.sql");
    }

    #[test]
    fn continues_after_highest_existing_number() {
        let temp = tempfile::tempdir().expect("tempdir");
        let dir = temp.path().join("db");
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("0007_old.sql"), "").expect("write");
        fs::write(dir.join("notes.txt"), "").expect("write");
        let path = write_migration(temp.path(), "db", Some("<add> index!"), "x").expect("write");
        assert_eq!(path, "db/0008_add_index.sql");
    }

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("  Add: RLS policies -- users "), "add_rls_policies_users");
        assert_eq!(slugify("!!!"), "");
    }
}
