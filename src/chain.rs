//! Tree walks over the CA hierarchy.
//!
//! Both walks read the parent/child relation from the store and carry a
//! visited set, so a corrupted store with a parent cycle terminates instead of
//! looping.

use rusqlite::Connection;
use std::collections::HashSet;
use tracing::warn;

use crate::error::{PkiError, PkiResult};
use crate::models::{Certificate, CertificateAuthority, Entity, EntityId, EntityKind};
use crate::store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    pub id: EntityId,
    pub kind: EntityKind,
    pub name: String,
    /// Subject in the signer's slash form.
    pub subject: String,
}

impl ChainLink {
    fn of_authority(ca: &CertificateAuthority) -> Self {
        Self {
            id: ca.id,
            kind: EntityKind::Authority,
            name: ca.name.clone(),
            subject: ca.subject.to_openssl(),
        }
    }

    fn of_certificate(cert: &Certificate) -> Self {
        Self {
            id: cert.id,
            kind: EntityKind::Certificate,
            name: cert.name.clone(),
            subject: cert.subject.to_openssl(),
        }
    }
}

/// `entity` and its issuers, root first and `entity` last.
pub fn ancestor_chain(conn: &Connection, entity: &Entity) -> PkiResult<Vec<ChainLink>> {
    let mut chain = vec![match entity {
        Entity::Authority(ca) => ChainLink::of_authority(ca),
        Entity::Certificate(cert) => ChainLink::of_certificate(cert),
    }];
    let mut visited = HashSet::new();
    if let Entity::Authority(ca) = entity {
        visited.insert(ca.id);
    }

    let mut next = entity.parent();
    while let Some(parent_id) = next {
        if !visited.insert(parent_id) {
            return Err(PkiError::consistency(format!(
                "issuer cycle above '{}'",
                entity.name()
            )));
        }
        let parent = store::get_authority(conn, parent_id)?
            .ok_or_else(|| PkiError::not_found("CA", format!("#{}", parent_id)))?;
        chain.push(ChainLink::of_authority(&parent));
        next = parent.parent;
    }
    chain.reverse();
    Ok(chain)
}

/// `"self-signed"` for a root, otherwise the issuer names joined root first.
pub fn render_ca_chain(issuers: &[ChainLink]) -> String {
    if issuers.is_empty() {
        "self-signed".to_string()
    } else {
        issuers
            .iter()
            .map(|link| link.name.as_str())
            .collect::<Vec<_>>()
            .join(" → ")
    }
}

/// Every CA and certificate below a CA, excluding the CA itself.
#[derive(Debug, Default)]
pub struct Descendants {
    /// Discovery order: a CA always precedes its own sub-CAs.
    pub authorities: Vec<CertificateAuthority>,
    pub certificates: Vec<Certificate>,
}

impl Descendants {
    pub fn is_empty(&self) -> bool {
        self.authorities.is_empty() && self.certificates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.authorities.len() + self.certificates.len()
    }
}

/// Transitive children of CA `root`, walked with an explicit worklist.
pub fn descendants_of(conn: &Connection, root: EntityId) -> PkiResult<Descendants> {
    let mut found = Descendants::default();
    let mut visited = HashSet::from([root]);
    let mut worklist = vec![root];

    while let Some(ca_id) = worklist.pop() {
        found
            .certificates
            .extend(store::child_certificates(conn, ca_id)?);
        for child in store::child_authorities(conn, ca_id)? {
            if !visited.insert(child.id) {
                warn!(ca = %child.name, "CA reached twice while walking the tree; skipping");
                continue;
            }
            worklist.push(child.id);
            found.authorities.push(child);
        }
    }
    Ok(found)
}
