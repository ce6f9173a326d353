//! End-to-end transitions against the real `openssl` binary.
//!
//! Each test returns early when no `openssl` is found on `PATH`.

use openssl::x509::X509Crl;
use pki_tree::bundle::DownloadCapability;
use pki_tree::configs::AppConfig;
use pki_tree::lifecycle::{LifecycleEngine, Passphrases};
use pki_tree::models::{
    CertificateBase, ChangeAction, Entity, EntityRef, NewAuthority, NewCertificate, Policy, Subject,
    UpdateRequest,
};
use pki_tree::paths::{self, ArtifactKind};
use pki_tree::signer::{normalize_serial, read_chain_subjects};
use pki_tree::PkiError;
use secrecy::SecretString;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tar::Archive;
use tempfile::TempDir;

const ROOT_PASS: &str = "root-passphrase";
const SUB_PASS: &str = "sub-passphrase";
const TEAM_PASS: &str = "team-passphrase";
const EXPORT_PASS: &str = "export-passphrase";

fn openssl_binary() -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join("openssl"))
        .find(|candidate| candidate.is_file())
}

struct Fixture {
    _tmp: TempDir,
    engine: LifecycleEngine,
}

fn fixture() -> Option<Fixture> {
    let Some(bin) = openssl_binary() else {
        eprintln!("openssl not found on PATH; skipping");
        return None;
    };
    let tmp = TempDir::new().unwrap();
    let mut config = AppConfig::with_pki_dir(tmp.path().join("PKI"));
    config.openssl_bin = bin;
    let mut engine = LifecycleEngine::open(config).unwrap();
    engine.reconcile("tester").unwrap();
    Some(Fixture { _tmp: tmp, engine })
}

fn secret(value: &str) -> SecretString {
    SecretString::new(value.to_string())
}

fn subject(common_name: &str) -> Subject {
    Subject {
        common_name: common_name.to_string(),
        country: "DE".to_string(),
        state: "Bavaria".to_string(),
        locality: "Munich".to_string(),
        organization: "Bozo Clown Inc.".to_string(),
        organizational_unit: Some("PKI".to_string()),
        email: None,
    }
}

fn new_ca(name: &str, parent: Option<&str>, valid_days: u32) -> NewAuthority {
    NewAuthority {
        name: name.to_string(),
        description: format!("{} for tests", name),
        subject: subject(&name.replace('_', " ")),
        parent: parent.map(str::to_string),
        key_length: 2048,
        valid_days,
        subcas_allowed: true,
        policy: Policy::Match,
        crl_distribution: Some(format!("http://pki.example.com/{}.crl", name)),
        extension: "v3_ca".to_string(),
        der_encoded: false,
    }
}

fn new_leaf(name: &str, parent: Option<&str>) -> NewCertificate {
    NewCertificate {
        name: name.to_string(),
        description: String::new(),
        subject: subject(&format!("{}.example.com", name)),
        parent: parent.map(str::to_string),
        key_length: 2048,
        valid_days: 90,
        extension: "v3_server_cert".to_string(),
        subject_alt_names: format!("DNS:{}.example.com,IP:10.0.0.1", name),
        der_encoded: false,
        pkcs12_encoded: false,
    }
}

fn create_root(engine: &mut LifecycleEngine) {
    engine
        .create_authority(
            new_ca("Root_CA", None, 1000),
            &Passphrases::own(secret(ROOT_PASS)),
            "tester",
        )
        .unwrap();
}

fn create_sub(engine: &mut LifecycleEngine) {
    engine
        .create_authority(
            new_ca("Sub_CA", Some("Root_CA"), 500),
            &Passphrases::own(secret(SUB_PASS)).with_parent(secret(ROOT_PASS)),
            "tester",
        )
        .unwrap();
}

fn leaf_ref(name: &str, parent: &str) -> EntityRef {
    EntityRef::Certificate {
        name: name.to_string(),
        parent: Some(parent.to_string()),
    }
}

fn crl_serials(engine: &LifecycleEngine, ca_name: &str) -> Vec<String> {
    let pem = fs::read(paths::crl_path(engine.config(), ca_name)).unwrap();
    let crl = X509Crl::from_pem(&pem).unwrap();
    crl.get_revoked()
        .map(|revoked| {
            revoked
                .iter()
                .map(|entry| {
                    let hex = entry.serial_number().to_bn().unwrap().to_hex_str().unwrap();
                    normalize_serial(&hex).trim_start_matches('0').to_string()
                })
                .collect()
        })
        .unwrap_or_default()
}

fn bare_serial(entity: &Entity) -> String {
    normalize_serial(entity.base().serial().unwrap())
        .trim_start_matches('0')
        .to_string()
}

#[test]
fn test_root_ca_creation() {
    let Some(Fixture { _tmp, mut engine }) = fixture() else {
        return;
    };
    create_root(&mut engine);

    let root = engine.find(&EntityRef::Authority("Root_CA".to_string())).unwrap();
    let ca = root.as_authority().unwrap();
    assert!(ca.active);
    assert_eq!(ca.serial.as_deref(), Some("07"));
    assert_eq!(ca.ca_chain, "self-signed");
    assert_eq!(ca.valid_days, 1000);

    let ca_dir = engine.config().ca_dir("Root_CA");
    let key = ca_dir.join("private").join("Root_CA.key.pem");
    let mode = fs::metadata(&key).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    assert!(paths::crl_path(engine.config(), "Root_CA").exists());
    assert!(crl_serials(&engine, "Root_CA").is_empty());

    let chain = read_chain_subjects(&ca_dir.join("Root_CA-chain.cert.pem")).unwrap();
    assert_eq!(chain, [ca.subject.to_openssl()]);

    let history = engine
        .changelog(&EntityRef::Authority("Root_CA".to_string()))
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, ChangeAction::Create);
    assert_eq!(history[0].actor, "tester");
}

#[test]
fn test_wrong_parent_passphrase_creates_nothing() {
    let Some(Fixture { _tmp, mut engine }) = fixture() else {
        return;
    };
    create_root(&mut engine);

    let result = engine.create_authority(
        new_ca("Sub_CA", Some("Root_CA"), 500),
        &Passphrases::own(secret(SUB_PASS)).with_parent(secret("not-the-root-pass")),
        "tester",
    );
    assert!(matches!(result, Err(PkiError::Authorization { .. })));
    assert!(matches!(
        engine.find(&EntityRef::Authority("Sub_CA".to_string())),
        Err(PkiError::NotFound { .. })
    ));
    assert!(!engine.config().ca_dir("Sub_CA").exists());
}

#[test]
fn test_chain_file_follows_ancestors() {
    let Some(Fixture { _tmp, mut engine }) = fixture() else {
        return;
    };
    create_root(&mut engine);
    create_sub(&mut engine);
    let leaf = engine
        .create_certificate(
            new_leaf("www", Some("Sub_CA")),
            &Passphrases::parent(secret(SUB_PASS)),
            "tester",
        )
        .unwrap();
    assert_eq!(leaf.ca_chain, "Root_CA → Sub_CA");

    let target = leaf_ref("www", "Sub_CA");
    let links = engine.ancestor_chain(&target).unwrap();
    let names: Vec<_> = links.iter().map(|l| l.name.as_str()).collect();
    assert_eq!(names, ["Root_CA", "Sub_CA", "www"]);

    let chain_path = engine
        .artifact(&target, ArtifactKind::Chain, DownloadCapability::default())
        .unwrap();
    let subjects = read_chain_subjects(&chain_path).unwrap();
    let expected: Vec<_> = links.iter().map(|l| l.subject.clone()).collect();
    assert_eq!(subjects, expected);
    assert!(!engine.is_revoked(&target).unwrap());
}

#[test]
fn test_revoking_intermediate_cascades() {
    let Some(Fixture { _tmp, mut engine }) = fixture() else {
        return;
    };
    create_root(&mut engine);
    create_sub(&mut engine);
    engine
        .create_certificate(
            new_leaf("www", Some("Sub_CA")),
            &Passphrases::parent(secret(SUB_PASS)),
            "tester",
        )
        .unwrap();

    let sub_ref = EntityRef::Authority("Sub_CA".to_string());
    let wrong = engine.revoke(&sub_ref, &Passphrases::parent(secret(SUB_PASS)), "tester");
    assert!(matches!(wrong, Err(PkiError::Authorization { .. })));

    let sub = engine
        .revoke(&sub_ref, &Passphrases::parent(secret(ROOT_PASS)), "tester")
        .unwrap();
    assert!(!sub.is_active());
    assert!(engine.is_revoked(&sub_ref).unwrap());
    assert!(crl_serials(&engine, "Root_CA").contains(&bare_serial(&sub)));

    let leaf_target = leaf_ref("www", "Sub_CA");
    let leaf = engine.find(&leaf_target).unwrap();
    assert!(!leaf.is_active());
    let history = engine.changelog(&leaf_target).unwrap();
    assert_eq!(history.last().map(|e| e.action), Some(ChangeAction::Broken));

    // revoked is terminal
    let renew = engine.renew(
        &leaf_target,
        None,
        &Passphrases::parent(secret(SUB_PASS)),
        "tester",
    );
    assert!(matches!(renew, Err(PkiError::Consistency(_))));
    assert!(matches!(
        engine.bundle(&leaf_target, DownloadCapability::default(), Vec::new()),
        Err(PkiError::Consistency(_))
    ));
    let child = engine.create_certificate(
        new_leaf("api", Some("Sub_CA")),
        &Passphrases::parent(secret(SUB_PASS)),
        "tester",
    );
    assert!(matches!(child, Err(PkiError::Consistency(_))));

    // a second revoke changes nothing
    let before = engine.changelog(&sub_ref).unwrap().len();
    engine
        .revoke(&sub_ref, &Passphrases::parent(secret(ROOT_PASS)), "tester")
        .unwrap();
    assert_eq!(engine.changelog(&sub_ref).unwrap().len(), before);
}

#[test]
fn test_root_cannot_be_revoked() {
    let Some(Fixture { _tmp, mut engine }) = fixture() else {
        return;
    };
    create_root(&mut engine);
    let result = engine.revoke(
        &EntityRef::Authority("Root_CA".to_string()),
        &Passphrases::own(secret(ROOT_PASS)).with_parent(secret(ROOT_PASS)),
        "tester",
    );
    assert!(matches!(result, Err(PkiError::Consistency(_))));
    let root = engine.find(&EntityRef::Authority("Root_CA".to_string())).unwrap();
    assert!(root.is_active());
}

#[test]
fn test_renew_reissues_and_revokes_old_serial() {
    let Some(Fixture { _tmp, mut engine }) = fixture() else {
        return;
    };
    create_root(&mut engine);
    create_sub(&mut engine);
    let target = leaf_ref("www", "Sub_CA");
    engine
        .create_certificate(
            new_leaf("www", Some("Sub_CA")),
            &Passphrases::parent(secret(SUB_PASS)),
            "tester",
        )
        .unwrap();
    let old = engine.find(&target).unwrap();

    let renewed = engine
        .renew(&target, Some(30), &Passphrases::parent(secret(SUB_PASS)), "tester")
        .unwrap();
    assert!(renewed.is_active());
    assert_eq!(renewed.base().valid_days(), 30);
    assert_ne!(renewed.base().serial(), old.base().serial());

    let revoked = crl_serials(&engine, "Sub_CA");
    assert!(revoked.contains(&bare_serial(&old)));
    assert!(!revoked.contains(&bare_serial(&renewed)));
    assert!(!engine.is_revoked(&target).unwrap());
    assert_eq!(
        engine.changelog(&target).unwrap().last().map(|e| e.action),
        Some(ChangeAction::Renew)
    );
}

#[test]
fn test_renew_with_wrong_pkcs12_passphrase_changes_nothing() {
    let Some(Fixture { _tmp, mut engine }) = fixture() else {
        return;
    };
    create_root(&mut engine);
    create_sub(&mut engine);
    let target = leaf_ref("www", "Sub_CA");
    let mut request = new_leaf("www", Some("Sub_CA"));
    request.pkcs12_encoded = true;
    engine
        .create_certificate(
            request,
            &Passphrases::parent(secret(SUB_PASS)).with_pkcs12(secret(EXPORT_PASS)),
            "tester",
        )
        .unwrap();
    let before = engine.find(&target).unwrap();
    let cert_path = engine
        .artifact(&target, ArtifactKind::Certificate, DownloadCapability::default())
        .unwrap();
    let p12_path = engine
        .artifact(&target, ArtifactKind::Pkcs12, DownloadCapability::default())
        .unwrap();
    let issued = fs::read(&cert_path).unwrap();
    let exported = fs::read(&p12_path).unwrap();

    let result = engine.renew(
        &target,
        None,
        &Passphrases::parent(secret(SUB_PASS)).with_pkcs12(secret("wrong-export-pass")),
        "tester",
    );
    assert!(matches!(result, Err(PkiError::Authorization { .. })));
    assert_eq!(fs::read(&cert_path).unwrap(), issued);
    assert_eq!(fs::read(&p12_path).unwrap(), exported);
    assert!(!engine.is_revoked(&target).unwrap());
    assert!(crl_serials(&engine, "Sub_CA").is_empty());
    assert_eq!(
        engine.find(&target).unwrap().base().serial(),
        before.base().serial()
    );

    let renewed = engine
        .renew(
            &target,
            None,
            &Passphrases::parent(secret(SUB_PASS)).with_pkcs12(secret(EXPORT_PASS)),
            "tester",
        )
        .unwrap();
    assert_ne!(renewed.base().serial(), before.base().serial());
    assert!(renewed.as_certificate().unwrap().pkcs12_encoded);
    assert!(p12_path.exists());
    assert!(crl_serials(&engine, "Sub_CA").contains(&bare_serial(&before)));
}

#[test]
fn test_renewing_intermediate_refreshes_descendant_chains() {
    let Some(Fixture { _tmp, mut engine }) = fixture() else {
        return;
    };
    create_root(&mut engine);
    create_sub(&mut engine);
    engine
        .create_certificate(
            new_leaf("www", Some("Sub_CA")),
            &Passphrases::parent(secret(SUB_PASS)),
            "tester",
        )
        .unwrap();
    let sub_ref = EntityRef::Authority("Sub_CA".to_string());
    let old_sub = engine.find(&sub_ref).unwrap();

    let renewed = engine
        .renew(
            &sub_ref,
            Some(400),
            &Passphrases::own(secret(SUB_PASS)).with_parent(secret(ROOT_PASS)),
            "tester",
        )
        .unwrap();
    assert!(renewed.is_active());
    assert_eq!(renewed.base().valid_days(), 400);
    assert_ne!(renewed.base().serial(), old_sub.base().serial());
    let revoked = crl_serials(&engine, "Root_CA");
    assert!(revoked.contains(&bare_serial(&old_sub)));
    assert!(!revoked.contains(&bare_serial(&renewed)));
    assert!(!engine.is_revoked(&sub_ref).unwrap());

    let leaf_target = leaf_ref("www", "Sub_CA");
    assert!(engine.find(&leaf_target).unwrap().is_active());
    let chain_path = engine
        .artifact(&leaf_target, ArtifactKind::Chain, DownloadCapability::default())
        .unwrap();
    let expected: Vec<_> = engine
        .ancestor_chain(&leaf_target)
        .unwrap()
        .into_iter()
        .map(|link| link.subject)
        .collect();
    assert_eq!(expected.len(), 3);
    assert_eq!(read_chain_subjects(&chain_path).unwrap(), expected);

    let sub_cert = fs::read_to_string(
        engine
            .artifact(&sub_ref, ArtifactKind::Certificate, DownloadCapability::default())
            .unwrap(),
    )
    .unwrap();
    assert!(fs::read_to_string(&chain_path)
        .unwrap()
        .contains(sub_cert.trim()));
}

#[test]
fn test_renewing_root_reissues_self_signed() {
    let Some(Fixture { _tmp, mut engine }) = fixture() else {
        return;
    };
    create_root(&mut engine);
    create_sub(&mut engine);
    let root_ref = EntityRef::Authority("Root_CA".to_string());
    let old_root = engine.find(&root_ref).unwrap();

    let wrong = engine.renew(&root_ref, None, &Passphrases::own(secret(SUB_PASS)), "tester");
    assert!(matches!(wrong, Err(PkiError::Authorization { .. })));

    let renewed = engine
        .renew(&root_ref, Some(2000), &Passphrases::own(secret(ROOT_PASS)), "tester")
        .unwrap();
    assert!(renewed.is_active());
    assert_eq!(renewed.base().valid_days(), 2000);
    assert_ne!(renewed.base().serial(), old_root.base().serial());
    assert_eq!(renewed.as_authority().unwrap().ca_chain, "self-signed");
    assert!(crl_serials(&engine, "Root_CA").is_empty());
    assert_eq!(
        engine.changelog(&root_ref).unwrap().last().map(|e| e.action),
        Some(ChangeAction::Renew)
    );

    let root_cert = fs::read_to_string(
        engine
            .artifact(&root_ref, ArtifactKind::Certificate, DownloadCapability::default())
            .unwrap(),
    )
    .unwrap();
    let sub_chain = engine
        .artifact(
            &EntityRef::Authority("Sub_CA".to_string()),
            ArtifactKind::Chain,
            DownloadCapability::default(),
        )
        .unwrap();
    assert!(fs::read_to_string(sub_chain)
        .unwrap()
        .contains(root_cert.trim()));
}

#[test]
fn test_revocation_cascades_through_every_level() {
    let Some(Fixture { _tmp, mut engine }) = fixture() else {
        return;
    };
    create_root(&mut engine);
    create_sub(&mut engine);
    engine
        .create_authority(
            new_ca("Team_CA", Some("Sub_CA"), 300),
            &Passphrases::own(secret(TEAM_PASS)).with_parent(secret(SUB_PASS)),
            "tester",
        )
        .unwrap();
    engine
        .create_certificate(
            new_leaf("www", Some("Team_CA")),
            &Passphrases::parent(secret(TEAM_PASS)),
            "tester",
        )
        .unwrap();
    engine
        .create_certificate(
            new_leaf("api", Some("Sub_CA")),
            &Passphrases::parent(secret(SUB_PASS)),
            "tester",
        )
        .unwrap();

    engine
        .revoke(
            &EntityRef::Authority("Sub_CA".to_string()),
            &Passphrases::parent(secret(ROOT_PASS)),
            "tester",
        )
        .unwrap();

    for target in [
        EntityRef::Authority("Team_CA".to_string()),
        leaf_ref("www", "Team_CA"),
        leaf_ref("api", "Sub_CA"),
    ] {
        assert!(!engine.find(&target).unwrap().is_active(), "{} still active", target);
        assert_eq!(
            engine.changelog(&target).unwrap().last().map(|e| e.action),
            Some(ChangeAction::Broken)
        );
    }
    let below = engine.descendants("Sub_CA").unwrap();
    assert_eq!(below.len(), 3);
    assert!(below.authorities.iter().all(|ca| !ca.active));
    assert!(below.certificates.iter().all(|cert| !cert.active));
    assert!(engine
        .find(&EntityRef::Authority("Root_CA".to_string()))
        .unwrap()
        .is_active());
}

#[test]
fn test_update_exports_and_delete_leaf() {
    let Some(Fixture { _tmp, mut engine }) = fixture() else {
        return;
    };
    create_root(&mut engine);
    create_sub(&mut engine);
    let target = leaf_ref("www", "Sub_CA");
    engine
        .create_certificate(
            new_leaf("www", Some("Sub_CA")),
            &Passphrases::parent(secret(SUB_PASS)),
            "tester",
        )
        .unwrap();

    assert!(matches!(
        engine.artifact(&target, ArtifactKind::Der, DownloadCapability::default()),
        Err(PkiError::NotFound { .. })
    ));
    let updated = engine
        .update(
            &target,
            UpdateRequest {
                description: Some("public web".to_string()),
                der_encoded: Some(true),
                pkcs12_encoded: None,
            },
            &Passphrases::parent(secret(SUB_PASS)),
            "tester",
        )
        .unwrap();
    assert_eq!(updated.base().description(), "public web");
    let der = engine
        .artifact(&target, ArtifactKind::Der, DownloadCapability::default())
        .unwrap();
    let first_export = fs::read(&der).unwrap();

    for flag in [false, true] {
        engine
            .update(
                &target,
                UpdateRequest {
                    der_encoded: Some(flag),
                    ..UpdateRequest::default()
                },
                &Passphrases::parent(secret(SUB_PASS)),
                "tester",
            )
            .unwrap();
        assert_eq!(der.exists(), flag);
    }
    assert_eq!(fs::read(&der).unwrap(), first_export);

    let owned: Vec<PathBuf> = [
        ArtifactKind::Key,
        ArtifactKind::Csr,
        ArtifactKind::Certificate,
        ArtifactKind::Chain,
    ]
    .into_iter()
    .map(|kind| {
        engine
            .artifact(&target, kind, DownloadCapability::with_private_key())
            .unwrap()
    })
    .collect();
    assert!(owned.iter().all(|path| path.exists()));

    engine
        .delete(&target, &Passphrases::parent(secret(SUB_PASS)), "tester")
        .unwrap();
    assert!(!der.exists());
    for path in &owned {
        assert!(!path.exists(), "{} survived delete", path.display());
    }
    assert!(matches!(engine.find(&target), Err(PkiError::NotFound { .. })));

    let sub_ref = EntityRef::Authority("Sub_CA".to_string());
    let sub = engine.find(&sub_ref).unwrap();
    assert!(sub.is_active());
    assert!(engine
        .artifact(&sub_ref, ArtifactKind::Certificate, DownloadCapability::default())
        .unwrap()
        .exists());
    assert!(paths::crl_path(engine.config(), "Sub_CA").exists());
    assert_eq!(
        engine.changelog(&sub_ref).unwrap().last().map(|e| e.action),
        Some(ChangeAction::Delete)
    );
}

#[test]
fn test_delete_ca_removes_subtree() {
    let Some(Fixture { _tmp, mut engine }) = fixture() else {
        return;
    };
    create_root(&mut engine);
    create_sub(&mut engine);
    engine
        .create_certificate(
            new_leaf("www", Some("Sub_CA")),
            &Passphrases::parent(secret(SUB_PASS)),
            "tester",
        )
        .unwrap();

    engine
        .delete(
            &EntityRef::Authority("Sub_CA".to_string()),
            &Passphrases::parent(secret(ROOT_PASS)),
            "tester",
        )
        .unwrap();
    assert!(!engine.config().ca_dir("Sub_CA").exists());
    assert!(engine.certificates().unwrap().is_empty());
    let names: Vec<_> = engine.authorities().unwrap().into_iter().map(|ca| ca.name).collect();
    assert_eq!(names, ["Root_CA"]);
}

#[test]
fn test_bundle_contents() {
    let Some(Fixture { _tmp, mut engine }) = fixture() else {
        return;
    };
    create_root(&mut engine);
    create_sub(&mut engine);
    let target = leaf_ref("www", "Sub_CA");
    engine
        .create_certificate(
            new_leaf("www", Some("Sub_CA")),
            &Passphrases::parent(secret(SUB_PASS)),
            "tester",
        )
        .unwrap();

    let mut out = Vec::new();
    let entries = engine
        .bundle(&target, DownloadCapability::default(), &mut out)
        .unwrap();
    assert!(entries.contains(&"PKI_DATA_www/www.cert.pem".to_string()));
    assert!(entries.contains(&"PKI_DATA_www/www-chain.cert.pem".to_string()));
    assert!(!entries.iter().any(|e| e.ends_with(".key.pem")));

    let archived: Vec<String> = Archive::new(&out[..])
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(archived, entries);

    let ca_entries = engine
        .bundle(
            &EntityRef::Authority("Sub_CA".to_string()),
            DownloadCapability::with_private_key(),
            Vec::new(),
        )
        .unwrap();
    assert!(ca_entries.contains(&"PKI_DATA_Sub_CA/Sub_CA.crl.pem".to_string()));
    assert!(ca_entries.contains(&"PKI_DATA_Sub_CA/Sub_CA.key.pem".to_string()));
}

#[test]
fn test_self_signed_leaf() {
    let Some(Fixture { _tmp, mut engine }) = fixture() else {
        return;
    };
    let cert = engine
        .create_certificate(new_leaf("standalone", None), &Passphrases::default(), "tester")
        .unwrap();
    assert_eq!(cert.ca_chain, "self-signed");

    let target = EntityRef::Certificate {
        name: "standalone".to_string(),
        parent: None,
    };
    let subjects = read_chain_subjects(
        &engine
            .artifact(&target, ArtifactKind::Chain, DownloadCapability::default())
            .unwrap(),
    )
    .unwrap();
    assert_eq!(subjects, [cert.subject.to_openssl()]);
    assert!(engine.show(&target).unwrap().contains("standalone.example.com"));
    assert!(matches!(
        engine.revoke(&target, &Passphrases::default(), "tester"),
        Err(PkiError::Consistency(_))
    ));
}
