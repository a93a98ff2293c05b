//! SQLite person store: one row per enrolled person with their face template.

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;
use vigil_core::{FaceTemplate, Identity};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS persons (
    identity        TEXT PRIMARY KEY NOT NULL,
    last_name       TEXT NOT NULL,
    first_name      TEXT NOT NULL,
    age             INTEGER,
    email           TEXT,
    phone           TEXT,
    template_width  INTEGER NOT NULL,
    template_height INTEGER NOT NULL,
    template        BLOB NOT NULL
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity {0} is already enrolled")]
    DuplicateIdentity(Identity),
    #[error("no person with identity {0}")]
    NotFound(Identity),
    #[error("invalid person record: {0}")]
    InvalidRecord(String),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Descriptive fields of a person; everything except identity and template.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PersonFields {
    pub last_name: String,
    pub first_name: String,
    pub age: Option<u32>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl PersonFields {
    /// Trim every field and turn blank optional fields into `None`.
    pub fn normalized(self) -> Self {
        let blank_to_none = |v: Option<String>| {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        };
        Self {
            last_name: self.last_name.trim().to_string(),
            first_name: self.first_name.trim().to_string(),
            age: self.age,
            email: blank_to_none(self.email),
            phone: blank_to_none(self.phone),
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.last_name.trim().is_empty() {
            return Err(StoreError::InvalidRecord("last name is required".into()));
        }
        if self.first_name.trim().is_empty() {
            return Err(StoreError::InvalidRecord("first name is required".into()));
        }
        Ok(())
    }

    /// "First Last", as shown next to a recognized face.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// "Last First", as written to the recognition history.
    pub fn record_name(&self) -> String {
        format!("{} {}", self.last_name, self.first_name)
    }
}

/// One row of the store. `template` is `None` when the stored pixels are unusable.
#[derive(Debug, Clone)]
pub struct StoredPerson {
    pub identity: Identity,
    pub fields: PersonFields,
    pub template: Option<FaceTemplate>,
}

/// Persistence for enrolled persons.
pub trait PersonStore: Send {
    fn enroll(
        &mut self,
        identity: &Identity,
        fields: &PersonFields,
        template: &FaceTemplate,
    ) -> Result<(), StoreError>;

    fn list_all(&self) -> Result<Vec<StoredPerson>, StoreError>;

    fn get(&self, identity: &Identity) -> Result<Option<StoredPerson>, StoreError>;

    fn update(&mut self, identity: &Identity, fields: &PersonFields) -> Result<(), StoreError>;

    fn delete(&mut self, identity: &Identity) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (or create) the database file, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let store = Self::with_connection(conn)?;
        tracing::info!(path = %path.display(), "person store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    fn row_to_person(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredPerson> {
        let identity: String = row.get(0)?;
        let template = read_template(row)?;
        if template.is_none() {
            tracing::warn!(identity = %identity, "stored template is unusable, skipping it");
        }

        Ok(StoredPerson {
            identity: Identity::new(identity),
            fields: PersonFields {
                last_name: row.get(1)?,
                first_name: row.get(2)?,
                age: row.get(3)?,
                email: row.get(4)?,
                phone: row.get(5)?,
            },
            template,
        })
    }
}

/// Template columns, or `None` when their types, sizes or pixel count are off.
fn read_template(row: &rusqlite::Row<'_>) -> rusqlite::Result<Option<FaceTemplate>> {
    let width = dimension(row.get_ref(6)?);
    let height = dimension(row.get_ref(7)?);
    let pixels = match row.get_ref(8)? {
        ValueRef::Blob(bytes) => Some(bytes.to_vec()),
        _ => None,
    };
    Ok(match (width, height, pixels) {
        (Some(w), Some(h), Some(p)) => FaceTemplate::from_raw(w, h, p),
        _ => None,
    })
}

fn dimension(value: ValueRef<'_>) -> Option<u32> {
    match value {
        ValueRef::Integer(v) => u32::try_from(v).ok(),
        _ => None,
    }
}

const SELECT_PERSON: &str = "SELECT identity, last_name, first_name, age, email, phone, \
     template_width, template_height, template FROM persons";

fn validate_identity(identity: &Identity) -> Result<(), StoreError> {
    if identity.as_str().trim().is_empty() {
        return Err(StoreError::InvalidRecord("identity is required".into()));
    }
    Ok(())
}

impl PersonStore for SqliteStore {
    fn enroll(
        &mut self,
        identity: &Identity,
        fields: &PersonFields,
        template: &FaceTemplate,
    ) -> Result<(), StoreError> {
        validate_identity(identity)?;
        fields.validate()?;

        let result = self.conn.execute(
            "INSERT INTO persons (identity, last_name, first_name, age, email, phone, \
             template_width, template_height, template) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                identity.as_str(),
                fields.last_name,
                fields.first_name,
                fields.age,
                fields.email,
                fields.phone,
                template.width(),
                template.height(),
                template.as_raw(),
            ],
        );

        match result {
            Ok(_) => {
                tracing::info!(identity = %identity, "person enrolled");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::DuplicateIdentity(identity.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list_all(&self) -> Result<Vec<StoredPerson>, StoreError> {
        let mut stmt = self.conn.prepare(&format!("{SELECT_PERSON} ORDER BY rowid"))?;
        let persons = stmt
            .query_map([], Self::row_to_person)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(persons)
    }

    fn get(&self, identity: &Identity) -> Result<Option<StoredPerson>, StoreError> {
        let person = self
            .conn
            .query_row(
                &format!("{SELECT_PERSON} WHERE identity = ?1"),
                params![identity.as_str()],
                Self::row_to_person,
            )
            .optional()?;
        Ok(person)
    }

    fn update(&mut self, identity: &Identity, fields: &PersonFields) -> Result<(), StoreError> {
        fields.validate()?;
        let changed = self.conn.execute(
            "UPDATE persons SET last_name = ?2, first_name = ?3, age = ?4, email = ?5, phone = ?6 \
             WHERE identity = ?1",
            params![
                identity.as_str(),
                fields.last_name,
                fields.first_name,
                fields.age,
                fields.email,
                fields.phone,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(identity.clone()));
        }
        tracing::info!(identity = %identity, "person updated");
        Ok(())
    }

    fn delete(&mut self, identity: &Identity) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute("DELETE FROM persons WHERE identity = ?1", params![identity.as_str()])?;
        if changed == 0 {
            return Err(StoreError::NotFound(identity.clone()));
        }
        tracing::info!(identity = %identity, "person deleted");
        Ok(())
    }
}
