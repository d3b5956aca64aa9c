//! Report recipients and their per-risk notification preferences.

use anyhow::{bail, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::report::RiskLevel;
use crate::storage::Pool;

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "yes")]
    pub notify_on_critical: bool,
    #[serde(default = "yes")]
    pub notify_on_high: bool,
    #[serde(default)]
    pub notify_on_medium: bool,
    #[serde(default)]
    pub notify_on_low: bool,
}

impl Recipient {
    pub fn new(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: name.into(),
            notify_on_critical: true,
            notify_on_high: true,
            notify_on_medium: false,
            notify_on_low: false,
        }
    }

    pub fn should_notify(&self, risk: RiskLevel) -> bool {
        match risk {
            RiskLevel::Critical => self.notify_on_critical,
            RiskLevel::High => self.notify_on_high,
            RiskLevel::Medium => self.notify_on_medium,
            RiskLevel::Low => self.notify_on_low,
        }
    }

    /// Minimal shape check; real validation is the relay's job.
    pub fn validate(&self) -> Result<()> {
        let email = self.email.trim();
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
            _ => bail!("invalid email address: '{}'", self.email),
        }
    }
}

/// Recipient list persisted in the `recipients` table.
#[derive(Clone)]
pub struct RecipientBook {
    pool: Pool,
}

impl RecipientBook {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Insert or replace by email.
    pub fn add(&self, recipient: &Recipient) -> Result<()> {
        recipient.validate()?;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO recipients
                (email, name, notify_on_critical, notify_on_high, notify_on_medium, notify_on_low)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(email) DO UPDATE SET
                name = excluded.name,
                notify_on_critical = excluded.notify_on_critical,
                notify_on_high = excluded.notify_on_high,
                notify_on_medium = excluded.notify_on_medium,
                notify_on_low = excluded.notify_on_low,
                updated_at = datetime('now')",
            params![
                recipient.email.trim(),
                recipient.name,
                recipient.notify_on_critical,
                recipient.notify_on_high,
                recipient.notify_on_medium,
                recipient.notify_on_low
            ],
        )?;
        info!(email = %recipient.email, "recipient saved");
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn remove(&self, email: &str) -> Result<bool> {
        let conn = self.pool.get()?;
        let n = conn.execute("DELETE FROM recipients WHERE email = ?1", params![email.trim()])?;
        if n > 0 {
            info!(%email, "recipient removed");
        }
        Ok(n > 0)
    }

    pub fn get(&self, email: &str) -> Result<Option<Recipient>> {
        let conn = self.pool.get()?;
        let recipient = conn
            .query_row(
                "SELECT email, name, notify_on_critical, notify_on_high, notify_on_medium, notify_on_low
                 FROM recipients WHERE email = ?1",
                params![email.trim()],
                row_to_recipient,
            )
            .optional()?;
        Ok(recipient)
    }

    pub fn list(&self) -> Result<Vec<Recipient>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT email, name, notify_on_critical, notify_on_high, notify_on_medium, notify_on_low
             FROM recipients ORDER BY email",
        )?;
        let rows = stmt
            .query_map([], row_to_recipient)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn row_to_recipient(row: &rusqlite::Row<'_>) -> rusqlite::Result<Recipient> {
    Ok(Recipient {
        email: row.get(0)?,
        name: row.get(1)?,
        notify_on_critical: row.get(2)?,
        notify_on_high: row.get(3)?,
        notify_on_medium: row.get(4)?,
        notify_on_low: row.get(5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_memory_pool;

    #[test]
    fn test_default_preferences() {
        let r = Recipient::new("ops@example.com", "Ops");
        assert!(r.should_notify(RiskLevel::Critical));
        assert!(r.should_notify(RiskLevel::High));
        assert!(!r.should_notify(RiskLevel::Medium));
        assert!(!r.should_notify(RiskLevel::Low));
    }

    #[test]
    fn test_serde_defaults_match_constructor() {
        let r: Recipient = serde_json::from_str(r#"{"email":"a@b.io"}"#).unwrap();
        assert_eq!(r, Recipient::new("a@b.io", ""));
    }

    #[test]
    fn test_validate_email() {
        assert!(Recipient::new("a@b.io", "").validate().is_ok());
        assert!(Recipient::new("nope", "").validate().is_err());
        assert!(Recipient::new("@b.io", "").validate().is_err());
        assert!(Recipient::new("a@localhost", "").validate().is_err());
    }

    #[test]
    fn test_add_is_upsert() {
        let book = RecipientBook::new(open_memory_pool().unwrap());
        book.add(&Recipient::new("ops@example.com", "Ops")).unwrap();

        let mut updated = Recipient::new("ops@example.com", "Operations");
        updated.notify_on_low = true;
        book.add(&updated).unwrap();

        let all = book.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], updated);
        assert_eq!(book.get("ops@example.com").unwrap(), Some(updated));
    }

    #[test]
    fn test_remove() {
        let book = RecipientBook::new(open_memory_pool().unwrap());
        book.add(&Recipient::new("a@example.com", "A")).unwrap();
        book.add(&Recipient::new("b@example.com", "B")).unwrap();

        assert!(book.remove("a@example.com").unwrap());
        assert!(!book.remove("a@example.com").unwrap());
        let emails: Vec<_> = book.list().unwrap().into_iter().map(|r| r.email).collect();
        assert_eq!(emails, vec!["b@example.com"]);
    }

    #[test]
    fn test_invalid_recipient_not_stored() {
        let book = RecipientBook::new(open_memory_pool().unwrap());
        assert!(book.add(&Recipient::new("bad", "")).is_err());
        assert!(book.list().unwrap().is_empty());
    }
}
