use rusqlite::{params, OptionalExtension};

use parley_shared::{Contact, UserId};

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn upsert_contact(&self, contact: &Contact) -> Result<()> {
        self.conn().execute(
            "INSERT INTO contacts (user_id, display_name, phone, avatar)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                 display_name = excluded.display_name,
                 phone = excluded.phone,
                 avatar = excluded.avatar",
            params![
                contact.user_id.as_str(),
                contact.display_name,
                contact.phone,
                contact.avatar,
            ],
        )?;
        Ok(())
    }

    pub fn get_contact(&self, user: &UserId) -> Result<Option<Contact>> {
        let row = self
            .conn()
            .query_row(
                "SELECT user_id, display_name, phone, avatar FROM contacts WHERE user_id = ?1",
                params![user.as_str()],
                row_to_contact,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_contacts(&self) -> Result<Vec<Contact>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id, display_name, phone, avatar FROM contacts ORDER BY user_id",
        )?;
        let rows = stmt.query_map([], row_to_contact)?;

        let mut contacts = Vec::new();
        for row in rows {
            contacts.push(row?);
        }
        Ok(contacts)
    }

    pub fn delete_contact(&self, user: &UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM contacts WHERE user_id = ?1",
            params![user.as_str()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let user_id: String = row.get(0)?;
    Ok(Contact {
        user_id: UserId(user_id),
        display_name: row.get(1)?,
        phone: row.get(2)?,
        avatar: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_fields() {
        let db = Database::open_in_memory().unwrap();
        let mut contact = Contact {
            user_id: UserId::from("bob"),
            display_name: Some("Bob".into()),
            phone: None,
            avatar: None,
        };
        db.upsert_contact(&contact).unwrap();

        contact.phone = Some("+100".into());
        db.upsert_contact(&contact).unwrap();

        assert_eq!(db.get_contact(&UserId::from("bob")).unwrap(), Some(contact));
        assert_eq!(db.list_contacts().unwrap().len(), 1);
    }
}
