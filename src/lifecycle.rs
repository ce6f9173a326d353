//! Lifecycle transitions of the CA tree.
//!
//! Every mutating operation runs as one transition:
//!
//! 1. validate input and look up the entities involved,
//! 2. check tree consistency (active parent, sub-CA permission, ...),
//! 3. verify passphrases,
//! 4. perform filesystem and signer effects,
//! 5. persist the new state and append to the changelog,
//! 6. commit.
//!
//! Steps 1-3 fail without side effects. Steps 4-6 run inside one database
//! transaction which is rolled back when any of them fails, so the metadata
//! never claims an artifact that was not produced.
//!
//! ```text
//!            create                 revoke (or ancestor revoked)
//!   (none) ─────────▶ active ───────────────────────────▶ revoked
//!                      │  ▲                                   │
//!                      └──┘ update / renew                    │
//!                      │                                      │
//!                      └────────────── delete ◀───────────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use secrecy::SecretString;
use std::collections::HashMap;
use std::fs::DirBuilder;
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::bundle::{self, DownloadCapability};
use crate::chain::{self, ChainLink, Descendants};
use crate::configs::AppConfig;
use crate::error::{PkiError, PkiResult};
use crate::metadata::MetadataStore;
use crate::models::{
    diff_fields, validate_key_length, validate_name, validate_valid_days, Certificate,
    CertificateAuthority, CertificateBase, ChangeAction, ChangelogEntry, Entity, EntityId,
    EntityRef, ExtensionClass, NewAuthority, NewCertificate, SubjectAltNames, UpdateRequest,
    X509Extension,
};
use crate::passphrase::{check_policy, hash_passphrase, verify_passphrase};
use crate::paths::ArtifactKind;
use crate::signer::{ExtensionRequest, SignerAdapter};
use crate::store;

/// Passphrases supplied by the operator for one transition.
///
/// `own` unlocks (or, on create, protects) the entity's key, `parent` the
/// issuing CA's key, and `pkcs12` protects a PKCS#12 export.
#[derive(Default)]
pub struct Passphrases {
    pub own: Option<SecretString>,
    pub parent: Option<SecretString>,
    pub pkcs12: Option<SecretString>,
}

impl Passphrases {
    pub fn own(passphrase: SecretString) -> Self {
        Self {
            own: Some(passphrase),
            ..Self::default()
        }
    }

    pub fn parent(passphrase: SecretString) -> Self {
        Self {
            parent: Some(passphrase),
            ..Self::default()
        }
    }

    pub fn with_own(mut self, passphrase: SecretString) -> Self {
        self.own = Some(passphrase);
        self
    }

    pub fn with_parent(mut self, passphrase: SecretString) -> Self {
        self.parent = Some(passphrase);
        self
    }

    pub fn with_pkcs12(mut self, passphrase: SecretString) -> Self {
        self.pkcs12 = Some(passphrase);
        self
    }
}

pub struct LifecycleEngine {
    config: AppConfig,
    conn: Connection,
}

impl LifecycleEngine {
    /// Open the engine on the configured store, creating it if needed.
    pub fn open(config: AppConfig) -> PkiResult<Self> {
        if !config.pki_dir().is_dir() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(config.pki_dir())?;
        }
        let conn = store::open(&config.database_path())?;
        Ok(Self { config, conn })
    }

    pub fn with_connection(config: AppConfig, conn: Connection) -> PkiResult<Self> {
        store::init(&conn)?;
        Ok(Self { config, conn })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn transition<T>(
        &mut self,
        operation: &str,
        actor: &str,
        body: impl FnOnce(&Transition) -> PkiResult<T>,
    ) -> PkiResult<T> {
        let tx = self.conn.transaction()?;
        let result = {
            let transition = Transition {
                config: &self.config,
                conn: &tx,
                actor,
                now: Utc::now(),
            };
            body(&transition)
        };
        match result {
            Ok(value) => {
                tx.commit()?;
                info!(operation, actor, "transition committed");
                Ok(value)
            }
            Err(e) => {
                warn!(operation, actor, error = %e, "transition aborted; metadata rolled back");
                Err(e)
            }
        }
    }

    /// Create or repair the on-disk layout for the current tree.
    pub fn reconcile(&mut self, actor: &str) -> PkiResult<()> {
        self.transition("reconcile", actor, |t| t.reconcile())
    }

    pub fn create_authority(
        &mut self,
        request: NewAuthority,
        secrets: &Passphrases,
        actor: &str,
    ) -> PkiResult<CertificateAuthority> {
        self.transition("create_ca", actor, |t| t.create_authority(request, secrets))
    }

    pub fn create_certificate(
        &mut self,
        request: NewCertificate,
        secrets: &Passphrases,
        actor: &str,
    ) -> PkiResult<Certificate> {
        self.transition("create_certificate", actor, |t| {
            t.create_certificate(request, secrets)
        })
    }

    /// Change description and export flags. Never touches key material.
    pub fn update(
        &mut self,
        target: &EntityRef,
        changes: UpdateRequest,
        secrets: &Passphrases,
        actor: &str,
    ) -> PkiResult<Entity> {
        self.transition("update", actor, |t| t.update(target, changes, secrets))
    }

    /// Re-issue the certificate, optionally with a new validity period.
    pub fn renew(
        &mut self,
        target: &EntityRef,
        valid_days: Option<u32>,
        secrets: &Passphrases,
        actor: &str,
    ) -> PkiResult<Entity> {
        self.transition("renew", actor, |t| t.renew(target, valid_days, secrets))
    }

    /// Revoke at the issuer; a CA takes its whole subtree down with it.
    pub fn revoke(
        &mut self,
        target: &EntityRef,
        secrets: &Passphrases,
        actor: &str,
    ) -> PkiResult<Entity> {
        self.transition("revoke", actor, |t| t.revoke(target, secrets))
    }

    pub fn delete(&mut self, target: &EntityRef, secrets: &Passphrases, actor: &str) -> PkiResult<()> {
        self.transition("delete", actor, |t| t.delete(target, secrets))
    }

    pub fn create_extension_profile(
        &mut self,
        profile: X509Extension,
        actor: &str,
    ) -> PkiResult<X509Extension> {
        self.transition("create_extension", actor, |t| t.create_extension(profile))
    }

    pub fn delete_extension_profile(&mut self, name: &str, actor: &str) -> PkiResult<()> {
        self.transition("delete_extension", actor, |t| t.delete_extension(name))
    }

    pub fn extension_profiles(&self) -> PkiResult<Vec<X509Extension>> {
        store::list_extensions(&self.conn)
    }

    pub fn find(&self, target: &EntityRef) -> PkiResult<Entity> {
        load_entity(&self.conn, target)
    }

    pub fn authorities(&self) -> PkiResult<Vec<CertificateAuthority>> {
        store::list_authorities(&self.conn)
    }

    pub fn certificates(&self) -> PkiResult<Vec<Certificate>> {
        store::list_certificates(&self.conn)
    }

    pub fn ancestor_chain(&self, target: &EntityRef) -> PkiResult<Vec<ChainLink>> {
        chain::ancestor_chain(&self.conn, &self.find(target)?)
    }

    pub fn descendants(&self, ca_name: &str) -> PkiResult<Descendants> {
        let ca = store::find_authority(&self.conn, ca_name)?
            .ok_or_else(|| PkiError::not_found("CA", ca_name))?;
        chain::descendants_of(&self.conn, ca.id)
    }

    pub fn changelog(&self, target: &EntityRef) -> PkiResult<Vec<ChangelogEntry>> {
        let entity = self.find(target)?;
        store::changelog_for(&self.conn, entity.kind(), entity.id())
    }

    fn signer_for(&self, entity: &Entity) -> PkiResult<SignerAdapter<'_>> {
        let parent = parent_of(&self.conn, entity)?;
        Ok(SignerAdapter::for_entity(&self.config, entity, parent.as_ref()))
    }

    /// Text dump of the entity's current certificate.
    pub fn show(&self, target: &EntityRef) -> PkiResult<String> {
        self.signer_for(&self.find(target)?)?.dump_text()
    }

    pub fn is_revoked(&self, target: &EntityRef) -> PkiResult<bool> {
        self.signer_for(&self.find(target)?)?.is_revoked()
    }

    /// Path of one artifact, subject to the download capability.
    pub fn artifact(
        &self,
        target: &EntityRef,
        kind: ArtifactKind,
        capability: DownloadCapability,
    ) -> PkiResult<PathBuf> {
        let entity = self.find(target)?;
        let signer = self.signer_for(&entity)?;
        bundle::artifact_path(&entity, signer.paths(), kind, capability)
    }

    /// Write a tar bundle of the entity's artifacts to `out`.
    pub fn bundle<W: Write>(
        &self,
        target: &EntityRef,
        capability: DownloadCapability,
        out: W,
    ) -> PkiResult<Vec<String>> {
        let entity = self.find(target)?;
        let signer = self.signer_for(&entity)?;
        bundle::write_bundle(&entity, signer.paths(), capability, out)
    }
}

fn load_entity(conn: &Connection, target: &EntityRef) -> PkiResult<Entity> {
    match target {
        EntityRef::Authority(name) => store::find_authority(conn, name)?
            .map(Entity::Authority)
            .ok_or_else(|| PkiError::not_found("CA", name.as_str())),
        EntityRef::Certificate { name, parent } => {
            let parent_id = match parent {
                Some(parent) => Some(
                    store::find_authority(conn, parent)?
                        .ok_or_else(|| PkiError::not_found("CA", parent.as_str()))?
                        .id,
                ),
                None => None,
            };
            store::find_certificate(conn, name, parent_id)?
                .map(Entity::Certificate)
                .ok_or_else(|| PkiError::not_found("certificate", name.as_str()))
        }
    }
}

fn parent_of(conn: &Connection, entity: &Entity) -> PkiResult<Option<CertificateAuthority>> {
    match entity.parent() {
        None => Ok(None),
        Some(id) => store::get_authority(conn, id)?.map(Some).ok_or_else(|| {
            PkiError::consistency(format!(
                "issuer #{} of '{}' is missing from the store",
                id,
                entity.name()
            ))
        }),
    }
}

fn required<'s>(passphrase: Option<&'s SecretString>, entity: &str) -> PkiResult<&'s SecretString> {
    passphrase.ok_or_else(|| PkiError::Authorization {
        entity: entity.to_string(),
    })
}

fn validate_crl_distribution(url: Option<&str>) -> PkiResult<()> {
    match url {
        Some(url)
            if !(url.starts_with("http://") || url.starts_with("https://"))
                || url.chars().any(char::is_whitespace) =>
        {
            Err(PkiError::validation(
                "crl_distribution",
                "must be an http(s) URL",
            ))
        }
        _ => Ok(()),
    }
}

/// End of a validity period starting `now`.
fn expiry(now: DateTime<Utc>, valid_days: u32) -> PkiResult<DateTime<Utc>> {
    now.checked_add_signed(Duration::days(i64::from(valid_days)))
        .ok_or_else(|| PkiError::validation("valid_days", "validity period is out of range"))
}

/// State shared by the steps of one transition.
struct Transition<'a> {
    config: &'a AppConfig,
    conn: &'a Connection,
    actor: &'a str,
    now: DateTime<Utc>,
}

impl Transition<'_> {
    fn reconcile(&self) -> PkiResult<()> {
        let authorities = store::list_authorities(self.conn)?;
        let profiles = store::list_extensions(self.conn)?;
        MetadataStore::new(self.config).reconcile(&authorities, &profiles)
    }

    fn profile(&self, name: &str) -> PkiResult<X509Extension> {
        store::find_extension(self.conn, name)?.ok_or_else(|| {
            PkiError::validation("extension", format!("unknown extension profile '{}'", name))
        })
    }

    fn active_issuer(&self, name: &str) -> PkiResult<CertificateAuthority> {
        let parent = store::find_authority(self.conn, name)?
            .ok_or_else(|| PkiError::not_found("CA", name))?;
        if !parent.active {
            return Err(PkiError::consistency(format!(
                "CA '{}' is revoked and cannot sign",
                name
            )));
        }
        Ok(parent)
    }

    fn persist(&self, entity: &Entity) -> PkiResult<()> {
        match entity {
            Entity::Authority(ca) => store::update_authority(self.conn, ca),
            Entity::Certificate(cert) => store::update_certificate(self.conn, cert),
        }
    }

    fn record(&self, entity: &Entity, action: ChangeAction, changes: String) -> PkiResult<()> {
        store::append_changelog(
            self.conn,
            &ChangelogEntry {
                id: 0,
                entity_kind: entity.kind(),
                entity_id: entity.id(),
                entity_name: entity.name().to_string(),
                action,
                actor: self.actor.to_string(),
                action_time: self.now,
                changes,
            },
        )?;
        Ok(())
    }

    /// Recompute the `ca_chain` text and rewrite the chain file.
    fn refresh_chain(
        &self,
        entity: &mut Entity,
        parent: Option<&CertificateAuthority>,
    ) -> PkiResult<()> {
        let links = chain::ancestor_chain(self.conn, entity)?;
        let issuers = links.split_last().map_or(&[][..], |(_, rest)| rest);
        let rendered = chain::render_ca_chain(issuers);
        match entity {
            Entity::Authority(ca) => ca.ca_chain = rendered,
            Entity::Certificate(cert) => cert.ca_chain = rendered,
        }
        SignerAdapter::for_entity(self.config, entity, parent).rebuild_chain_file(&links)
    }

    /// Passphrase of whoever controls the entity: its issuer, or the entity
    /// itself when it has none.
    fn authorize_controller(
        &self,
        entity: &Entity,
        parent: Option<&CertificateAuthority>,
        secrets: &Passphrases,
    ) -> PkiResult<()> {
        match (parent, entity) {
            (Some(parent), _) => {
                verify_passphrase(secrets.parent.as_ref(), &parent.passphrase, &parent.name)
            }
            (None, Entity::Authority(ca)) => {
                verify_passphrase(secrets.own.as_ref(), &ca.passphrase, &ca.name)
            }
            (None, Entity::Certificate(cert)) => match &cert.passphrase {
                Some(hash) => verify_passphrase(secrets.own.as_ref(), hash, &cert.name),
                None => Ok(()),
            },
        }
    }

    /// Verify the passphrase of the entity's own key, if it has one.
    fn authorize_own_key(&self, entity: &Entity, secrets: &Passphrases) -> PkiResult<()> {
        match entity {
            Entity::Authority(ca) => {
                verify_passphrase(secrets.own.as_ref(), &ca.passphrase, &ca.name)
            }
            Entity::Certificate(cert) => match &cert.passphrase {
                Some(hash) => verify_passphrase(secrets.own.as_ref(), hash, &cert.name),
                None => Ok(()),
            },
        }
    }

    fn create_authority(
        &self,
        request: NewAuthority,
        secrets: &Passphrases,
    ) -> PkiResult<CertificateAuthority> {
        validate_name("name", &request.name)?;
        let subject = request.subject.normalized();
        subject.validate()?;
        validate_key_length(request.key_length)?;
        validate_valid_days(request.valid_days)?;
        let expiry_date = expiry(self.now, request.valid_days)?;
        validate_crl_distribution(request.crl_distribution.as_deref())?;
        check_policy(
            "passphrase",
            secrets.own.as_ref(),
            true,
            self.config.min_passphrase_length,
        )?;
        let own = required(secrets.own.as_ref(), &request.name)?;

        let profile = self.profile(&request.extension)?;
        match profile.class {
            ExtensionClass::EndEntity => {
                return Err(PkiError::validation(
                    "extension",
                    format!("'{}' is an end-entity profile", profile.name),
                ))
            }
            ExtensionClass::EdgeAuthority if request.subcas_allowed => {
                return Err(PkiError::validation(
                    "subcas_allowed",
                    "an edge CA cannot sign sub-CAs",
                ))
            }
            _ => {}
        }
        if store::find_authority(self.conn, &request.name)?.is_some() {
            return Err(PkiError::validation(
                "name",
                format!("CA '{}' already exists", request.name),
            ));
        }
        if store::authority_common_name_taken(self.conn, &subject.common_name)? {
            return Err(PkiError::validation(
                "common_name",
                format!("a CA named '{}' already exists", subject.common_name),
            ));
        }

        let parent = match &request.parent {
            Some(name) => {
                let parent = self.active_issuer(name)?;
                if !parent.subcas_allowed {
                    return Err(PkiError::consistency(format!(
                        "CA '{}' is not allowed to sign sub-CAs",
                        parent.name
                    )));
                }
                verify_passphrase(secrets.parent.as_ref(), &parent.passphrase, &parent.name)?;
                Some(parent)
            }
            None => None,
        };

        let mut ca = CertificateAuthority {
            id: 0,
            name: request.name,
            description: request.description,
            subject,
            parent: parent.as_ref().map(|p| p.id),
            active: true,
            serial: None,
            passphrase: hash_passphrase(own)?,
            key_length: request.key_length,
            valid_days: request.valid_days,
            created: Some(self.now),
            expiry_date: Some(expiry_date),
            revoked: None,
            subcas_allowed: request.subcas_allowed,
            policy: request.policy,
            crl_distribution: request.crl_distribution,
            extension: profile.name.clone(),
            ca_chain: String::new(),
            der_encoded: request.der_encoded,
        };
        ca.id = store::insert_authority(self.conn, &ca)?;
        self.reconcile()?;

        let signer = SignerAdapter::for_authority(self.config, &ca, parent.as_ref());
        signer.generate_key(Some(own))?;
        match &parent {
            None => {
                let extension = ExtensionRequest::new(&profile, None, None);
                signer.generate_self_signed(Some(own), &extension, true)?;
            }
            Some(parent) => {
                let parent_pass = required(secrets.parent.as_ref(), &parent.name)?;
                let extension =
                    ExtensionRequest::new(&profile, None, parent.crl_distribution.as_deref());
                signer.generate_csr(Some(own))?;
                signer.sign_csr(parent_pass, &extension)?;
                signer.generate_crl(&parent.name, parent_pass)?;
            }
        }
        signer.generate_crl(&ca.name, own)?;
        if ca.der_encoded {
            signer.export_der()?;
        }
        ca.serial = Some(signer.serial()?);

        let mut entity = Entity::Authority(ca);
        self.refresh_chain(&mut entity, parent.as_ref())?;
        self.persist(&entity)?;
        self.record(&entity, ChangeAction::Create, diff_fields(None, &entity)?)?;
        info!(ca = %entity.name(), issuer = ?parent.as_ref().map(|p| &p.name), "CA created");

        match entity {
            Entity::Authority(ca) => Ok(ca),
            Entity::Certificate(_) => Err(PkiError::consistency("CA turned into a certificate")),
        }
    }

    fn create_certificate(
        &self,
        request: NewCertificate,
        secrets: &Passphrases,
    ) -> PkiResult<Certificate> {
        validate_name("name", &request.name)?;
        if request.name.ends_with("-chain") {
            return Err(PkiError::validation(
                "name",
                "may not end in '-chain'",
            ));
        }
        let subject = request.subject.normalized();
        subject.validate()?;
        validate_key_length(request.key_length)?;
        validate_valid_days(request.valid_days)?;
        let expiry_date = expiry(self.now, request.valid_days)?;
        let subject_alt_names = SubjectAltNames::parse(&request.subject_alt_names)?;
        let min = self.config.min_passphrase_length;
        check_policy("passphrase", secrets.own.as_ref(), false, min)?;
        check_policy(
            "pkcs12_passphrase",
            secrets.pkcs12.as_ref(),
            request.pkcs12_encoded,
            min,
        )?;

        let profile = self.profile(&request.extension)?;
        if profile.class != ExtensionClass::EndEntity {
            return Err(PkiError::validation(
                "extension",
                format!("'{}' is a CA profile", profile.name),
            ));
        }

        let parent = match &request.parent {
            Some(name) => {
                if *name == request.name {
                    return Err(PkiError::validation(
                        "name",
                        "may not equal the name of the issuing CA",
                    ));
                }
                Some(self.active_issuer(name)?)
            }
            None => None,
        };
        let parent_id = parent.as_ref().map(|p| p.id);
        if store::find_certificate(self.conn, &request.name, parent_id)?.is_some() {
            return Err(PkiError::validation(
                "name",
                format!("certificate '{}' already exists", request.name),
            ));
        }
        if store::certificate_common_name_taken(self.conn, &subject.common_name, parent_id)? {
            return Err(PkiError::validation(
                "common_name",
                format!(
                    "a certificate for '{}' already exists under this issuer",
                    subject.common_name
                ),
            ));
        }
        if let Some(parent) = &parent {
            verify_passphrase(secrets.parent.as_ref(), &parent.passphrase, &parent.name)?;
        }

        let mut cert = Certificate {
            id: 0,
            name: request.name,
            description: request.description,
            subject,
            parent: parent_id,
            active: true,
            serial: None,
            passphrase: secrets.own.as_ref().map(hash_passphrase).transpose()?,
            key_length: request.key_length,
            valid_days: request.valid_days,
            created: Some(self.now),
            expiry_date: Some(expiry_date),
            revoked: None,
            extension: profile.name.clone(),
            subject_alt_names,
            der_encoded: request.der_encoded,
            pkcs12_encoded: request.pkcs12_encoded,
            pkcs12_passphrase: None,
            ca_chain: String::new(),
        };
        cert.id = store::insert_certificate(self.conn, &cert)?;

        let signer = SignerAdapter::for_certificate(self.config, &cert, parent.as_ref());
        let own = secrets.own.as_ref();
        signer.generate_key(own)?;
        let sans = cert.subject_alt_names.to_openssl();
        match &parent {
            None => {
                let extension = ExtensionRequest::new(&profile, sans, None);
                signer.generate_self_signed(own, &extension, false)?;
            }
            Some(parent) => {
                let parent_pass = required(secrets.parent.as_ref(), &parent.name)?;
                let extension =
                    ExtensionRequest::new(&profile, sans, parent.crl_distribution.as_deref());
                signer.generate_csr(own)?;
                signer.sign_csr(parent_pass, &extension)?;
                signer.generate_crl(&parent.name, parent_pass)?;
            }
        }
        if cert.der_encoded {
            signer.export_der()?;
        }
        if cert.pkcs12_encoded {
            let export_pass = required(secrets.pkcs12.as_ref(), &cert.name)?;
            signer.export_pkcs12(export_pass)?;
            cert.pkcs12_passphrase = Some(hash_passphrase(export_pass)?);
        }
        cert.serial = Some(signer.serial()?);

        let mut entity = Entity::Certificate(cert);
        self.refresh_chain(&mut entity, parent.as_ref())?;
        self.persist(&entity)?;
        self.record(&entity, ChangeAction::Create, diff_fields(None, &entity)?)?;
        info!(certificate = %entity.name(), issuer = ?parent.as_ref().map(|p| &p.name), "certificate created");

        match entity {
            Entity::Certificate(cert) => Ok(cert),
            Entity::Authority(_) => Err(PkiError::consistency("certificate turned into a CA")),
        }
    }

    fn update(
        &self,
        target: &EntityRef,
        changes: UpdateRequest,
        secrets: &Passphrases,
    ) -> PkiResult<Entity> {
        let mut entity = load_entity(self.conn, target)?;
        if changes.pkcs12_encoded.is_some() && matches!(entity, Entity::Authority(_)) {
            return Err(PkiError::validation(
                "pkcs12_encoded",
                "CAs have no PKCS#12 export",
            ));
        }
        if changes.pkcs12_encoded == Some(true) {
            check_policy(
                "pkcs12_passphrase",
                secrets.pkcs12.as_ref(),
                true,
                self.config.min_passphrase_length,
            )?;
        }
        if !entity.is_active() {
            return Err(PkiError::consistency(format!(
                "'{}' is revoked and cannot be updated",
                entity.name()
            )));
        }
        let parent = parent_of(self.conn, &entity)?;
        self.authorize_controller(&entity, parent.as_ref(), secrets)?;

        let before = entity.clone();
        let signer = SignerAdapter::for_entity(self.config, &entity, parent.as_ref());
        match changes.der_encoded {
            Some(true) => signer.export_der()?,
            Some(false) => signer.remove_der()?,
            None => {}
        }
        match changes.pkcs12_encoded {
            Some(true) => {
                let export_pass = required(secrets.pkcs12.as_ref(), entity.name())?;
                signer.export_pkcs12(export_pass)?;
                if let Entity::Certificate(cert) = &mut entity {
                    cert.pkcs12_passphrase = Some(hash_passphrase(export_pass)?);
                }
            }
            Some(false) => {
                signer.remove_pkcs12()?;
                if let Entity::Certificate(cert) = &mut entity {
                    cert.pkcs12_passphrase = None;
                }
            }
            None => {}
        }

        match &mut entity {
            Entity::Authority(ca) => {
                if let Some(description) = changes.description {
                    ca.description = description;
                }
                if let Some(der) = changes.der_encoded {
                    ca.der_encoded = der;
                }
            }
            Entity::Certificate(cert) => {
                if let Some(description) = changes.description {
                    cert.description = description;
                }
                if let Some(der) = changes.der_encoded {
                    cert.der_encoded = der;
                }
                if let Some(pkcs12) = changes.pkcs12_encoded {
                    cert.pkcs12_encoded = pkcs12;
                }
            }
        }
        self.persist(&entity)?;
        self.record(&entity, ChangeAction::Update, diff_fields(Some(&before), &entity)?)?;
        Ok(entity)
    }

    fn renew(
        &self,
        target: &EntityRef,
        valid_days: Option<u32>,
        secrets: &Passphrases,
    ) -> PkiResult<Entity> {
        if let Some(days) = valid_days {
            validate_valid_days(days)?;
        }
        let mut entity = load_entity(self.conn, target)?;
        if !entity.is_active() {
            return Err(PkiError::consistency(format!(
                "'{}' is revoked; revocation is terminal",
                entity.name()
            )));
        }
        let parent = parent_of(self.conn, &entity)?;
        if let Some(parent) = &parent {
            if !parent.active {
                return Err(PkiError::consistency(format!(
                    "issuer '{}' of '{}' is revoked",
                    parent.name,
                    entity.name()
                )));
            }
            verify_passphrase(secrets.parent.as_ref(), &parent.passphrase, &parent.name)?;
        }
        self.authorize_own_key(&entity, secrets)?;
        let pkcs12_pass = match &entity {
            Entity::Certificate(cert) if cert.pkcs12_encoded => {
                match (secrets.pkcs12.as_ref(), &cert.pkcs12_passphrase) {
                    (Some(export_pass), Some(hash)) => {
                        verify_passphrase(Some(export_pass), hash, &cert.name)?;
                        Some(export_pass)
                    }
                    _ => None,
                }
            }
            _ => None,
        };

        let before = entity.clone();
        let days = valid_days.unwrap_or(entity.base().valid_days());
        let expiry_date = expiry(self.now, days)?;
        match &mut entity {
            Entity::Authority(ca) => ca.valid_days = days,
            Entity::Certificate(cert) => cert.valid_days = days,
        }
        if let Entity::Authority(ca) = &entity {
            store::update_authority(self.conn, ca)?;
            self.reconcile()?;
        }

        let (extension_name, sans) = match &entity {
            Entity::Authority(ca) => (ca.extension.clone(), None),
            Entity::Certificate(cert) => {
                (cert.extension.clone(), cert.subject_alt_names.to_openssl())
            }
        };
        let profile = self.profile(&extension_name)?;
        let own = secrets.own.as_ref();
        let signer = SignerAdapter::for_entity(self.config, &entity, parent.as_ref());
        match &parent {
            Some(parent) => {
                let parent_pass = required(secrets.parent.as_ref(), &parent.name)?;
                signer.revoke(parent_pass)?;
                let extension =
                    ExtensionRequest::new(&profile, sans, parent.crl_distribution.as_deref());
                signer.generate_csr(own)?;
                signer.sign_csr(parent_pass, &extension)?;
                signer.generate_crl(&parent.name, parent_pass)?;
            }
            None => {
                let extension = ExtensionRequest::new(&profile, sans, None);
                signer.generate_self_signed(own, &extension, false)?;
                if let Entity::Authority(ca) = &entity {
                    signer.generate_crl(&ca.name, required(own, &ca.name)?)?;
                }
            }
        }

        if entity.base().der_encoded() {
            signer.export_der()?;
        }
        if let Entity::Certificate(cert) = &mut entity {
            if cert.pkcs12_encoded {
                match pkcs12_pass {
                    Some(export_pass) => signer.export_pkcs12(export_pass)?,
                    None => {
                        warn!(certificate = %cert.name, "no PKCS#12 passphrase given; dropping stale export");
                        signer.remove_pkcs12()?;
                        cert.pkcs12_encoded = false;
                        cert.pkcs12_passphrase = None;
                    }
                }
            }
        }

        let serial = signer.serial()?;
        let now = self.now;
        match &mut entity {
            Entity::Authority(ca) => {
                ca.serial = Some(serial);
                ca.created = Some(now);
                ca.expiry_date = Some(expiry_date);
                ca.revoked = None;
            }
            Entity::Certificate(cert) => {
                cert.serial = Some(serial);
                cert.created = Some(now);
                cert.expiry_date = Some(expiry_date);
                cert.revoked = None;
            }
        }
        self.refresh_chain(&mut entity, parent.as_ref())?;
        self.persist(&entity)?;
        if let Entity::Authority(ca) = &entity {
            self.refresh_descendant_chains(ca)?;
        }
        self.record(&entity, ChangeAction::Renew, diff_fields(Some(&before), &entity)?)?;
        info!(entity = %entity.name(), days, "renewed");
        Ok(entity)
    }

    /// Chain files below a renewed CA embed its old certificate.
    fn refresh_descendant_chains(&self, ca: &CertificateAuthority) -> PkiResult<()> {
        let below = chain::descendants_of(self.conn, ca.id)?;
        let mut issuers: HashMap<EntityId, CertificateAuthority> = HashMap::new();
        issuers.insert(ca.id, ca.clone());
        for sub in &below.authorities {
            issuers.insert(sub.id, sub.clone());
        }
        let active = below
            .authorities
            .iter()
            .filter(|sub| sub.active)
            .cloned()
            .map(Entity::Authority)
            .chain(
                below
                    .certificates
                    .iter()
                    .filter(|cert| cert.active)
                    .cloned()
                    .map(Entity::Certificate),
            );
        for entity in active {
            let parent = entity.parent().and_then(|id| issuers.get(&id));
            let links = chain::ancestor_chain(self.conn, &entity)?;
            SignerAdapter::for_entity(self.config, &entity, parent).rebuild_chain_file(&links)?;
        }
        Ok(())
    }

    fn revoke(&self, target: &EntityRef, secrets: &Passphrases) -> PkiResult<Entity> {
        let mut entity = load_entity(self.conn, target)?;
        let parent = parent_of(self.conn, &entity)?.ok_or_else(|| {
            PkiError::consistency(format!(
                "'{}' is self-signed; delete it instead of revoking",
                entity.name()
            ))
        })?;
        if !entity.is_active() {
            info!(entity = %entity.name(), "already revoked; nothing to do");
            return Ok(entity);
        }
        verify_passphrase(secrets.parent.as_ref(), &parent.passphrase, &parent.name)?;
        let parent_pass = required(secrets.parent.as_ref(), &parent.name)?;

        let signer = SignerAdapter::for_entity(self.config, &entity, Some(&parent));
        signer.revoke(parent_pass)?;
        signer.generate_crl(&parent.name, parent_pass)?;
        self.deactivate(&mut entity, Some(&parent), ChangeAction::Revoke)?;

        if let Entity::Authority(ca) = &entity {
            let below = chain::descendants_of(self.conn, ca.id)?;
            let mut issuers: HashMap<EntityId, CertificateAuthority> = HashMap::new();
            issuers.insert(ca.id, ca.clone());
            for sub in &below.authorities {
                issuers.insert(sub.id, sub.clone());
            }
            let broken = below
                .authorities
                .into_iter()
                .map(Entity::Authority)
                .chain(below.certificates.into_iter().map(Entity::Certificate))
                .filter(Entity::is_active);
            let mut count = 0;
            for mut descendant in broken {
                let issuer = descendant.parent().and_then(|id| issuers.get(&id));
                self.deactivate(&mut descendant, issuer, ChangeAction::Broken)?;
                count += 1;
            }
            info!(ca = %ca.name, descendants = count, "revocation cascaded");
        }
        Ok(entity)
    }

    /// Mark inactive and drop the DER / PKCS#12 exports.
    fn deactivate(
        &self,
        entity: &mut Entity,
        parent: Option<&CertificateAuthority>,
        action: ChangeAction,
    ) -> PkiResult<()> {
        let before = entity.clone();
        let signer = SignerAdapter::for_entity(self.config, entity, parent);
        signer.remove_der()?;
        signer.remove_pkcs12()?;
        let now = self.now;
        match entity {
            Entity::Authority(ca) => {
                ca.active = false;
                ca.der_encoded = false;
                ca.revoked = Some(now);
            }
            Entity::Certificate(cert) => {
                cert.active = false;
                cert.der_encoded = false;
                cert.pkcs12_encoded = false;
                cert.pkcs12_passphrase = None;
                cert.revoked = Some(now);
            }
        }
        self.persist(entity)?;
        self.record(entity, action, diff_fields(Some(&before), &*entity)?)
    }

    fn delete(&self, target: &EntityRef, secrets: &Passphrases) -> PkiResult<()> {
        let entity = load_entity(self.conn, target)?;
        let parent = parent_of(self.conn, &entity)?;
        self.authorize_controller(&entity, parent.as_ref(), secrets)?;

        let signer = SignerAdapter::for_entity(self.config, &entity, parent.as_ref());
        if let Some(parent) = parent.as_ref().filter(|p| p.active) {
            if signer.paths().cert.exists() {
                let parent_pass = required(secrets.parent.as_ref(), &parent.name)?;
                signer.revoke(parent_pass)?;
                signer.generate_crl(&parent.name, parent_pass)?;
            }
        }
        signer.purge_all_artifacts()?;

        let mut removed = 1;
        match &entity {
            Entity::Authority(ca) => {
                let below = chain::descendants_of(self.conn, ca.id)?;
                removed += below.len();
                for cert in &below.certificates {
                    store::delete_certificate(self.conn, cert.id)?;
                    store::delete_changelog_for(self.conn, cert.kind(), cert.id)?;
                }
                // children before their issuers
                for sub in below.authorities.iter().rev() {
                    store::delete_authority(self.conn, sub.id)?;
                    store::delete_changelog_for(self.conn, sub.kind(), sub.id)?;
                }
                store::delete_authority(self.conn, ca.id)?;
            }
            Entity::Certificate(cert) => store::delete_certificate(self.conn, cert.id)?,
        }
        self.reconcile()?;

        if let Some(parent) = parent {
            let issuer = Entity::Authority(parent);
            self.record(
                &issuer,
                ChangeAction::Delete,
                format!("deleted {} '{}'", entity.kind(), entity.name()),
            )?;
        }
        store::delete_changelog_for(self.conn, entity.kind(), entity.id())?;
        info!(entity = %entity.name(), removed, "deleted");
        Ok(())
    }

    fn create_extension(&self, mut profile: X509Extension) -> PkiResult<X509Extension> {
        profile.validate()?;
        if store::find_extension(self.conn, &profile.name)?.is_some() {
            return Err(PkiError::validation(
                "name",
                format!("extension profile '{}' already exists", profile.name),
            ));
        }
        profile.created = Some(self.now);
        profile.id = store::insert_extension(self.conn, &profile)?;
        self.reconcile()?;
        info!(profile = %profile.name, actor = self.actor, "extension profile created");
        Ok(profile)
    }

    fn delete_extension(&self, name: &str) -> PkiResult<()> {
        if store::find_extension(self.conn, name)?.is_none() {
            return Err(PkiError::not_found("extension profile", name));
        }
        let usage = store::extension_usage(self.conn, name)?;
        if usage > 0 {
            return Err(PkiError::consistency(format!(
                "extension profile '{}' is used by {} entities",
                name, usage
            )));
        }
        store::delete_extension(self.conn, name)?;
        self.reconcile()?;
        info!(profile = name, actor = self.actor, "extension profile deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Policy, Subject};
    use tempfile::TempDir;

    fn secret(value: &str) -> SecretString {
        SecretString::new(value.to_string())
    }

    fn subject(cn: &str) -> Subject {
        Subject {
            common_name: cn.to_string(),
            country: "DE".to_string(),
            state: "Bavaria".to_string(),
            locality: "Munich".to_string(),
            organization: "Bozo Clown Inc.".to_string(),
            organizational_unit: None,
            email: None,
        }
    }

    fn root_request(name: &str) -> NewAuthority {
        NewAuthority {
            name: name.to_string(),
            description: String::new(),
            subject: subject(name),
            parent: None,
            key_length: 2048,
            valid_days: 1000,
            subcas_allowed: true,
            policy: Policy::Match,
            crl_distribution: None,
            extension: "v3_ca".to_string(),
            der_encoded: false,
        }
    }

    fn engine(tmp: &TempDir) -> LifecycleEngine {
        let config = AppConfig::with_pki_dir(tmp.path().join("PKI"));
        LifecycleEngine::open(config).unwrap()
    }

    #[test]
    fn test_rejects_bad_name_before_side_effects() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp);
        let mut request = root_request("Root CA");
        request.subject = subject("Root CA");
        let err = engine
            .create_authority(request, &Passphrases::own(secret("long enough")), "test")
            .unwrap_err();
        assert!(matches!(err, PkiError::Validation { field, .. } if field == "name"));
        assert!(engine.authorities().unwrap().is_empty());
        assert!(!engine.config().ca_dir("Root CA").exists());
    }

    #[test]
    fn test_short_passphrase_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp);
        let err = engine
            .create_authority(root_request("Root_CA"), &Passphrases::own(secret("short")), "test")
            .unwrap_err();
        assert!(matches!(err, PkiError::Validation { field, .. } if field == "passphrase"));
    }

    #[test]
    fn test_expiry_out_of_range_is_a_validation_error() {
        let now = Utc::now();
        assert_eq!(expiry(now, 10).unwrap(), now + Duration::days(10));
        assert!(matches!(
            expiry(now, u32::MAX),
            Err(PkiError::Validation { field, .. }) if field == "valid_days"
        ));
    }

    #[test]
    fn test_huge_validity_is_rejected_before_side_effects() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp);
        let mut request = root_request("Root_CA");
        request.valid_days = u32::MAX;
        let err = engine
            .create_authority(request, &Passphrases::own(secret("long enough")), "test")
            .unwrap_err();
        assert!(matches!(err, PkiError::Validation { field, .. } if field == "valid_days"));
        assert!(engine.authorities().unwrap().is_empty());
        assert!(!engine.config().ca_dir("Root_CA").exists());

        let leaf = NewCertificate {
            name: "www".to_string(),
            description: String::new(),
            subject: subject("www.example.com"),
            parent: None,
            key_length: 2048,
            valid_days: u32::MAX,
            extension: "v3_server_cert".to_string(),
            subject_alt_names: String::new(),
            der_encoded: false,
            pkcs12_encoded: false,
        };
        let err = engine
            .create_certificate(leaf, &Passphrases::default(), "test")
            .unwrap_err();
        assert!(matches!(err, PkiError::Validation { field, .. } if field == "valid_days"));
        assert!(engine.certificates().unwrap().is_empty());
    }

    #[test]
    fn test_end_entity_profile_cannot_make_a_ca() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp);
        let mut request = root_request("Root_CA");
        request.extension = "v3_server_cert".to_string();
        let err = engine
            .create_authority(request, &Passphrases::own(secret("long enough")), "test")
            .unwrap_err();
        assert!(matches!(err, PkiError::Validation { field, .. } if field == "extension"));
    }

    #[test]
    fn test_missing_parent_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp);
        let mut request = root_request("Sub_CA");
        request.parent = Some("Nope".to_string());
        let err = engine
            .create_authority(request, &Passphrases::own(secret("long enough")), "test")
            .unwrap_err();
        assert!(matches!(err, PkiError::NotFound { .. }));
    }

    #[test]
    fn test_failed_signer_rolls_back_metadata() {
        let tmp = TempDir::new().unwrap();
        let mut config = AppConfig::with_pki_dir(tmp.path().join("PKI"));
        config.openssl_bin = tmp.path().join("no-such-openssl");
        let mut engine = LifecycleEngine::open(config).unwrap();
        let err = engine
            .create_authority(
                root_request("Root_CA"),
                &Passphrases::own(secret("long enough")),
                "test",
            )
            .unwrap_err();
        assert!(matches!(err, PkiError::SignerExecution { command } if command == "genrsa"));
        assert!(engine.authorities().unwrap().is_empty());
        assert!(engine
            .find(&EntityRef::Authority("Root_CA".to_string()))
            .is_err());
    }

    #[test]
    fn test_extension_profile_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let mut engine = engine(&tmp);
        let mut profile = X509Extension::defaults()
            .into_iter()
            .find(|p| p.name == "v3_server_cert")
            .unwrap();
        profile.name = "v3_web".to_string();
        let created = engine.create_extension_profile(profile.clone(), "test").unwrap();
        assert!(created.id > 0);
        let conf = std::fs::read_to_string(engine.config().openssl_conf_path()).unwrap();
        assert!(conf.contains("[ v3_web_san_cdp ]"));

        assert!(matches!(
            engine.create_extension_profile(profile, "test"),
            Err(PkiError::Validation { .. })
        ));
        engine.delete_extension_profile("v3_web", "test").unwrap();
        assert!(matches!(
            engine.delete_extension_profile("v3_web", "test"),
            Err(PkiError::NotFound { .. })
        ));
        assert_eq!(engine.extension_profiles().unwrap().len(), 4);
    }
}
