//! SQLite persistence for the CA tree, extension profiles and the changelog.
//!
//! All functions take a plain `&Connection`; the lifecycle engine hands in an
//! open transaction so one transition commits or rolls back as a unit.

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tracing::debug;

use crate::error::PkiResult;
use crate::models::{
    Certificate, CertificateAuthority, ChangeAction, ChangelogEntry, EntityId, EntityKind,
    ExtensionClass, Policy, Subject, SubjectAltNames, X509Extension,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS x509_extensions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL,
    class TEXT NOT NULL,
    basic_constraints TEXT NOT NULL,
    basic_constraints_critical INTEGER NOT NULL,
    key_usage TEXT NOT NULL,
    key_usage_critical INTEGER NOT NULL,
    extended_key_usage TEXT NOT NULL,
    extended_key_usage_critical INTEGER NOT NULL,
    subject_key_identifier TEXT NOT NULL,
    authority_key_identifier TEXT NOT NULL,
    crl_distribution_point INTEGER NOT NULL,
    created TEXT
);

CREATE TABLE IF NOT EXISTS certificate_authorities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL,
    common_name TEXT NOT NULL UNIQUE,
    country TEXT NOT NULL,
    state TEXT NOT NULL,
    locality TEXT NOT NULL,
    organization TEXT NOT NULL,
    organizational_unit TEXT,
    email TEXT,
    parent_id INTEGER REFERENCES certificate_authorities(id),
    active INTEGER NOT NULL,
    serial TEXT,
    passphrase TEXT NOT NULL,
    key_length INTEGER NOT NULL,
    valid_days INTEGER NOT NULL,
    created TEXT,
    expiry_date TEXT,
    revoked TEXT,
    subcas_allowed INTEGER NOT NULL,
    policy TEXT NOT NULL,
    crl_distribution TEXT,
    extension TEXT NOT NULL REFERENCES x509_extensions(name),
    ca_chain TEXT NOT NULL,
    der_encoded INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS certificates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    common_name TEXT NOT NULL,
    country TEXT NOT NULL,
    state TEXT NOT NULL,
    locality TEXT NOT NULL,
    organization TEXT NOT NULL,
    organizational_unit TEXT,
    email TEXT,
    parent_id INTEGER REFERENCES certificate_authorities(id),
    active INTEGER NOT NULL,
    serial TEXT,
    passphrase TEXT,
    key_length INTEGER NOT NULL,
    valid_days INTEGER NOT NULL,
    created TEXT,
    expiry_date TEXT,
    revoked TEXT,
    extension TEXT NOT NULL REFERENCES x509_extensions(name),
    subject_alt_names TEXT NOT NULL,
    der_encoded INTEGER NOT NULL,
    pkcs12_encoded INTEGER NOT NULL,
    pkcs12_passphrase TEXT,
    ca_chain TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS changelog (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_kind TEXT NOT NULL,
    entity_id INTEGER NOT NULL,
    entity_name TEXT NOT NULL,
    action TEXT NOT NULL,
    actor TEXT NOT NULL,
    action_time TEXT NOT NULL,
    changes TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_certificates_parent ON certificates(parent_id);
CREATE INDEX IF NOT EXISTS idx_authorities_parent ON certificate_authorities(parent_id);
CREATE INDEX IF NOT EXISTS idx_changelog_entity ON changelog(entity_kind, entity_id);
";

const AUTHORITY_COLUMNS: &str = "id, name, description, common_name, country, state, locality, \
    organization, organizational_unit, email, parent_id, active, serial, passphrase, key_length, \
    valid_days, created, expiry_date, revoked, subcas_allowed, policy, crl_distribution, \
    extension, ca_chain, der_encoded";

const CERTIFICATE_COLUMNS: &str = "id, name, description, common_name, country, state, locality, \
    organization, organizational_unit, email, parent_id, active, serial, passphrase, key_length, \
    valid_days, created, expiry_date, revoked, extension, subject_alt_names, der_encoded, \
    pkcs12_encoded, pkcs12_passphrase, ca_chain";

const EXTENSION_COLUMNS: &str = "id, name, description, class, basic_constraints, \
    basic_constraints_critical, key_usage, key_usage_critical, extended_key_usage, \
    extended_key_usage_critical, subject_key_identifier, authority_key_identifier, \
    crl_distribution_point, created";

/// Open (or create) the database file and bring the schema up.
pub fn open(path: &Path) -> PkiResult<Connection> {
    let conn = Connection::open(path)?;
    init(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> PkiResult<Connection> {
    let conn = Connection::open_in_memory()?;
    init(&conn)?;
    Ok(conn)
}

/// Create tables and seed the default extension profiles.
pub fn init(conn: &Connection) -> PkiResult<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA)?;
    let now = Utc::now();
    for profile in X509Extension::defaults() {
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO x509_extensions ({}) \
                 VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                EXTENSION_COLUMNS
            ),
            params![
                profile.name,
                profile.description,
                profile.class.as_str(),
                profile.basic_constraints,
                profile.basic_constraints_critical,
                profile.key_usage.join(","),
                profile.key_usage_critical,
                profile.extended_key_usage.join(","),
                profile.extended_key_usage_critical,
                profile.subject_key_identifier,
                profile.authority_key_identifier,
                profile.crl_distribution_point,
                now,
            ],
        )?;
        if inserted > 0 {
            debug!(profile = %profile.name, "seeded extension profile");
        }
    }
    Ok(())
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn subject_from_row(row: &Row) -> rusqlite::Result<Subject> {
    Ok(Subject {
        common_name: row.get(3)?,
        country: row.get(4)?,
        state: row.get(5)?,
        locality: row.get(6)?,
        organization: row.get(7)?,
        organizational_unit: row.get(8)?,
        email: row.get(9)?,
    })
}

fn authority_from_row(row: &Row) -> rusqlite::Result<CertificateAuthority> {
    let policy: String = row.get(20)?;
    Ok(CertificateAuthority {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        subject: subject_from_row(row)?,
        parent: row.get(10)?,
        active: row.get(11)?,
        serial: row.get(12)?,
        passphrase: row.get(13)?,
        key_length: row.get(14)?,
        valid_days: row.get(15)?,
        created: row.get(16)?,
        expiry_date: row.get(17)?,
        revoked: row.get(18)?,
        subcas_allowed: row.get(19)?,
        policy: Policy::parse(&policy).map_err(|e| conversion_error(20, e.to_string()))?,
        crl_distribution: row.get(21)?,
        extension: row.get(22)?,
        ca_chain: row.get(23)?,
        der_encoded: row.get(24)?,
    })
}

fn certificate_from_row(row: &Row) -> rusqlite::Result<Certificate> {
    let sans: String = row.get(20)?;
    Ok(Certificate {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        subject: subject_from_row(row)?,
        parent: row.get(10)?,
        active: row.get(11)?,
        serial: row.get(12)?,
        passphrase: row.get(13)?,
        key_length: row.get(14)?,
        valid_days: row.get(15)?,
        created: row.get(16)?,
        expiry_date: row.get(17)?,
        revoked: row.get(18)?,
        extension: row.get(19)?,
        subject_alt_names: SubjectAltNames::parse(&sans)
            .map_err(|e| conversion_error(20, e.to_string()))?,
        der_encoded: row.get(21)?,
        pkcs12_encoded: row.get(22)?,
        pkcs12_passphrase: row.get(23)?,
        ca_chain: row.get(24)?,
    })
}

fn split_list(value: String) -> Vec<String> {
    value
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn extension_from_row(row: &Row) -> rusqlite::Result<X509Extension> {
    let class: String = row.get(3)?;
    Ok(X509Extension {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        class: ExtensionClass::parse(&class).map_err(|e| conversion_error(3, e.to_string()))?,
        basic_constraints: row.get(4)?,
        basic_constraints_critical: row.get(5)?,
        key_usage: split_list(row.get(6)?),
        key_usage_critical: row.get(7)?,
        extended_key_usage: split_list(row.get(8)?),
        extended_key_usage_critical: row.get(9)?,
        subject_key_identifier: row.get(10)?,
        authority_key_identifier: row.get(11)?,
        crl_distribution_point: row.get(12)?,
        created: row.get(13)?,
    })
}

fn changelog_from_row(row: &Row) -> rusqlite::Result<ChangelogEntry> {
    let kind: String = row.get(1)?;
    let action: String = row.get(4)?;
    Ok(ChangelogEntry {
        id: row.get(0)?,
        entity_kind: EntityKind::parse(&kind)
            .ok_or_else(|| conversion_error(1, format!("unknown entity kind '{}'", kind)))?,
        entity_id: row.get(2)?,
        entity_name: row.get(3)?,
        action: ChangeAction::parse(&action)
            .ok_or_else(|| conversion_error(4, format!("unknown action '{}'", action)))?,
        actor: row.get(5)?,
        action_time: row.get(6)?,
        changes: row.get(7)?,
    })
}

// ---------------------------------------------------------------------------
// Certificate authorities
// ---------------------------------------------------------------------------

pub fn insert_authority(conn: &Connection, ca: &CertificateAuthority) -> PkiResult<EntityId> {
    conn.execute(
        &format!(
            "INSERT INTO certificate_authorities ({}) VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, \
             ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            AUTHORITY_COLUMNS
        ),
        params![
            ca.name,
            ca.description,
            ca.subject.common_name,
            ca.subject.country,
            ca.subject.state,
            ca.subject.locality,
            ca.subject.organization,
            ca.subject.organizational_unit,
            ca.subject.email,
            ca.parent,
            ca.active,
            ca.serial,
            ca.passphrase,
            ca.key_length,
            ca.valid_days,
            ca.created,
            ca.expiry_date,
            ca.revoked,
            ca.subcas_allowed,
            ca.policy.as_str(),
            ca.crl_distribution,
            ca.extension,
            ca.ca_chain,
            ca.der_encoded,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Persist the mutable fields of an existing CA.
pub fn update_authority(conn: &Connection, ca: &CertificateAuthority) -> PkiResult<()> {
    conn.execute(
        "UPDATE certificate_authorities SET description = ?2, active = ?3, serial = ?4, \
         valid_days = ?5, created = ?6, expiry_date = ?7, revoked = ?8, ca_chain = ?9, \
         der_encoded = ?10 WHERE id = ?1",
        params![
            ca.id,
            ca.description,
            ca.active,
            ca.serial,
            ca.valid_days,
            ca.created,
            ca.expiry_date,
            ca.revoked,
            ca.ca_chain,
            ca.der_encoded,
        ],
    )?;
    Ok(())
}

pub fn delete_authority(conn: &Connection, id: EntityId) -> PkiResult<()> {
    conn.execute(
        "DELETE FROM certificate_authorities WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}

pub fn get_authority(conn: &Connection, id: EntityId) -> PkiResult<Option<CertificateAuthority>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM certificate_authorities WHERE id = ?1",
                AUTHORITY_COLUMNS
            ),
            params![id],
            authority_from_row,
        )
        .optional()?)
}

pub fn find_authority(conn: &Connection, name: &str) -> PkiResult<Option<CertificateAuthority>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM certificate_authorities WHERE name = ?1",
                AUTHORITY_COLUMNS
            ),
            params![name],
            authority_from_row,
        )
        .optional()?)
}

pub fn authority_common_name_taken(conn: &Connection, common_name: &str) -> PkiResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM certificate_authorities WHERE common_name = ?1",
        params![common_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn list_authorities(conn: &Connection) -> PkiResult<Vec<CertificateAuthority>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM certificate_authorities ORDER BY id",
        AUTHORITY_COLUMNS
    ))?;
    let rows = stmt.query_map([], authority_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn child_authorities(
    conn: &Connection,
    parent: EntityId,
) -> PkiResult<Vec<CertificateAuthority>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM certificate_authorities WHERE parent_id = ?1 ORDER BY id",
        AUTHORITY_COLUMNS
    ))?;
    let rows = stmt.query_map(params![parent], authority_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// ---------------------------------------------------------------------------
// Leaf certificates
// ---------------------------------------------------------------------------

pub fn insert_certificate(conn: &Connection, cert: &Certificate) -> PkiResult<EntityId> {
    conn.execute(
        &format!(
            "INSERT INTO certificates ({}) VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, \
             ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
            CERTIFICATE_COLUMNS
        ),
        params![
            cert.name,
            cert.description,
            cert.subject.common_name,
            cert.subject.country,
            cert.subject.state,
            cert.subject.locality,
            cert.subject.organization,
            cert.subject.organizational_unit,
            cert.subject.email,
            cert.parent,
            cert.active,
            cert.serial,
            cert.passphrase,
            cert.key_length,
            cert.valid_days,
            cert.created,
            cert.expiry_date,
            cert.revoked,
            cert.extension,
            cert.subject_alt_names.to_string(),
            cert.der_encoded,
            cert.pkcs12_encoded,
            cert.pkcs12_passphrase,
            cert.ca_chain,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn update_certificate(conn: &Connection, cert: &Certificate) -> PkiResult<()> {
    conn.execute(
        "UPDATE certificates SET description = ?2, active = ?3, serial = ?4, valid_days = ?5, \
         created = ?6, expiry_date = ?7, revoked = ?8, der_encoded = ?9, pkcs12_encoded = ?10, \
         pkcs12_passphrase = ?11, ca_chain = ?12 WHERE id = ?1",
        params![
            cert.id,
            cert.description,
            cert.active,
            cert.serial,
            cert.valid_days,
            cert.created,
            cert.expiry_date,
            cert.revoked,
            cert.der_encoded,
            cert.pkcs12_encoded,
            cert.pkcs12_passphrase,
            cert.ca_chain,
        ],
    )?;
    Ok(())
}

pub fn delete_certificate(conn: &Connection, id: EntityId) -> PkiResult<()> {
    conn.execute("DELETE FROM certificates WHERE id = ?1", params![id])?;
    Ok(())
}

pub fn get_certificate(conn: &Connection, id: EntityId) -> PkiResult<Option<Certificate>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM certificates WHERE id = ?1", CERTIFICATE_COLUMNS),
            params![id],
            certificate_from_row,
        )
        .optional()?)
}

/// Certificate names are unique per issuer (or among self-signed leaves).
pub fn find_certificate(
    conn: &Connection,
    name: &str,
    parent: Option<EntityId>,
) -> PkiResult<Option<Certificate>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM certificates WHERE name = ?1 AND parent_id IS ?2",
                CERTIFICATE_COLUMNS
            ),
            params![name, parent],
            certificate_from_row,
        )
        .optional()?)
}

pub fn certificate_common_name_taken(
    conn: &Connection,
    common_name: &str,
    parent: Option<EntityId>,
) -> PkiResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM certificates WHERE common_name = ?1 AND parent_id IS ?2",
        params![common_name, parent],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub fn list_certificates(conn: &Connection) -> PkiResult<Vec<Certificate>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM certificates ORDER BY id",
        CERTIFICATE_COLUMNS
    ))?;
    let rows = stmt.query_map([], certificate_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn child_certificates(conn: &Connection, parent: EntityId) -> PkiResult<Vec<Certificate>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM certificates WHERE parent_id = ?1 ORDER BY id",
        CERTIFICATE_COLUMNS
    ))?;
    let rows = stmt.query_map(params![parent], certificate_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

// ---------------------------------------------------------------------------
// Extension profiles
// ---------------------------------------------------------------------------

pub fn insert_extension(conn: &Connection, profile: &X509Extension) -> PkiResult<i64> {
    conn.execute(
        &format!(
            "INSERT INTO x509_extensions ({}) \
             VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            EXTENSION_COLUMNS
        ),
        params![
            profile.name,
            profile.description,
            profile.class.as_str(),
            profile.basic_constraints,
            profile.basic_constraints_critical,
            profile.key_usage.join(","),
            profile.key_usage_critical,
            profile.extended_key_usage.join(","),
            profile.extended_key_usage_critical,
            profile.subject_key_identifier,
            profile.authority_key_identifier,
            profile.crl_distribution_point,
            profile.created,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn find_extension(conn: &Connection, name: &str) -> PkiResult<Option<X509Extension>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM x509_extensions WHERE name = ?1",
                EXTENSION_COLUMNS
            ),
            params![name],
            extension_from_row,
        )
        .optional()?)
}

pub fn list_extensions(conn: &Connection) -> PkiResult<Vec<X509Extension>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM x509_extensions ORDER BY id",
        EXTENSION_COLUMNS
    ))?;
    let rows = stmt.query_map([], extension_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Number of CAs and certificates signed with profile `name`.
pub fn extension_usage(conn: &Connection, name: &str) -> PkiResult<i64> {
    Ok(conn.query_row(
        "SELECT (SELECT COUNT(*) FROM certificate_authorities WHERE extension = ?1) + \
                (SELECT COUNT(*) FROM certificates WHERE extension = ?1)",
        params![name],
        |row| row.get(0),
    )?)
}

pub fn delete_extension(conn: &Connection, name: &str) -> PkiResult<bool> {
    let deleted = conn.execute("DELETE FROM x509_extensions WHERE name = ?1", params![name])?;
    Ok(deleted > 0)
}

// ---------------------------------------------------------------------------
// Changelog
// ---------------------------------------------------------------------------

/// Append `entry`; its `id` is assigned by the store.
pub fn append_changelog(conn: &Connection, entry: &ChangelogEntry) -> PkiResult<i64> {
    conn.execute(
        "INSERT INTO changelog (entity_kind, entity_id, entity_name, action, actor, action_time, changes) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.entity_kind.as_str(),
            entry.entity_id,
            entry.entity_name,
            entry.action.as_str(),
            entry.actor,
            entry.action_time,
            entry.changes
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// History of one entity, oldest first.
pub fn changelog_for(
    conn: &Connection,
    kind: EntityKind,
    entity_id: EntityId,
) -> PkiResult<Vec<ChangelogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, entity_kind, entity_id, entity_name, action, actor, action_time, changes \
         FROM changelog WHERE entity_kind = ?1 AND entity_id = ?2 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![kind.as_str(), entity_id], changelog_from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn delete_changelog_for(
    conn: &Connection,
    kind: EntityKind,
    entity_id: EntityId,
) -> PkiResult<()> {
    conn.execute(
        "DELETE FROM changelog WHERE entity_kind = ?1 AND entity_id = ?2",
        params![kind.as_str(), entity_id],
    )?;
    Ok(())
}
