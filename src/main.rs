//! `pki-tree` command line front end.
//!
//! Every subcommand opens the store, runs one lifecycle operation and exits.
//! Passphrases are always prompted for, never taken from arguments.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use pki_tree::bundle::DownloadCapability;
use pki_tree::configs::AppConfig;
use pki_tree::extensions::{ExtensionClass, X509Extension};
use pki_tree::lifecycle::{LifecycleEngine, Passphrases};
use pki_tree::models::{
    Certificate, CertificateAuthority, Entity, EntityId, EntityRef, NewAuthority, NewCertificate,
    Policy, Subject, UpdateRequest,
};
use secrecy::SecretString;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pki-tree")]
#[command(about = "Hierarchical certificate authority manager", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file; built-in defaults when absent
    #[arg(short, long, default_value = "pki.toml")]
    config: PathBuf,

    /// Override the PKI base directory
    #[arg(long)]
    pki_dir: Option<PathBuf>,

    /// Name recorded in the changelog (defaults to $USER)
    #[arg(long)]
    actor: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or repair the store layout and signer configuration
    Init,

    /// Create a root CA, or an intermediate CA with --parent
    CreateCa {
        name: String,
        #[arg(short, long)]
        parent: Option<String>,
        #[command(flatten)]
        subject: SubjectArgs,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(long)]
        key_length: Option<u32>,
        #[arg(long, default_value_t = 3650)]
        days: u32,
        /// Forbid this CA from signing sub-CAs
        #[arg(long)]
        no_subcas: bool,
        /// policy_match or policy_anything
        #[arg(long, default_value = "policy_match")]
        policy: String,
        /// CRL URL embedded into certificates this CA issues
        #[arg(long)]
        crl_url: Option<String>,
        #[arg(long, default_value = "v3_ca")]
        extension: String,
        /// Also export the certificate as DER
        #[arg(long)]
        der: bool,
    },

    /// Create a leaf certificate, self-signed without --parent
    CreateCert {
        name: String,
        #[arg(short, long)]
        parent: Option<String>,
        #[command(flatten)]
        subject: SubjectArgs,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(long)]
        key_length: Option<u32>,
        #[arg(long, default_value_t = 365)]
        days: u32,
        #[arg(long, default_value = "v3_server_cert")]
        extension: String,
        /// Comma separated DNS:, IP: and email: entries
        #[arg(long, default_value = "")]
        san: String,
        /// Protect the private key with a passphrase
        #[arg(long)]
        encrypt_key: bool,
        #[arg(long)]
        der: bool,
        #[arg(long)]
        pkcs12: bool,
    },

    /// Change description or export flags
    Update {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(short, long)]
        description: Option<String>,
        #[arg(long)]
        der: Option<bool>,
        #[arg(long)]
        pkcs12: Option<bool>,
    },

    /// Re-issue a certificate
    Renew {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        days: Option<u32>,
    },

    /// Revoke at the issuer; a CA takes its subtree down with it
    Revoke {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Remove an entity, its subtree and all artifacts
    Delete {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Print the CA tree
    List,

    /// Print the current certificate as text
    Show {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Print the issuer chain, root first
    Chain {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Print the changelog of an entity
    History {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Write a tar bundle of an entity's artifacts
    Bundle {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(short, long)]
        output: PathBuf,
        /// Include the private key
        #[arg(long)]
        with_key: bool,
    },

    /// Manage x509v3 extension profiles
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    List,
    Create {
        name: String,
        /// ca, edge_ca or end_entity
        #[arg(long)]
        class: String,
        #[arg(long)]
        basic_constraints: String,
        /// Comma separated keyUsage values
        #[arg(long)]
        key_usage: String,
        /// Comma separated extendedKeyUsage values
        #[arg(long, default_value = "")]
        extended_key_usage: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Do not embed the issuer's CRL URL
        #[arg(long)]
        no_crl_distribution: bool,
    },
    Delete {
        name: String,
    },
}

#[derive(Args)]
struct SubjectArgs {
    #[arg(long)]
    common_name: String,
    /// Two letter country code; config default when omitted
    #[arg(long)]
    country: Option<String>,
    #[arg(long)]
    state: String,
    #[arg(long)]
    locality: String,
    #[arg(long)]
    organization: String,
    #[arg(long)]
    organizational_unit: Option<String>,
    #[arg(long)]
    email: Option<String>,
}

impl SubjectArgs {
    fn into_subject(self, config: &AppConfig) -> Subject {
        Subject {
            common_name: self.common_name,
            country: self
                .country
                .unwrap_or_else(|| config.default_country.clone()),
            state: self.state,
            locality: self.locality,
            organization: self.organization,
            organizational_unit: self.organizational_unit,
            email: self.email,
        }
    }
}

#[derive(Args)]
struct TargetArgs {
    name: String,
    /// The target is a CA
    #[arg(long, conflicts_with = "issuer")]
    ca: bool,
    /// Issuing CA of a certificate; omit for self-signed certificates
    #[arg(long)]
    issuer: Option<String>,
}

impl TargetArgs {
    fn entity_ref(&self) -> EntityRef {
        if self.ca {
            EntityRef::Authority(self.name.clone())
        } else {
            EntityRef::Certificate {
                name: self.name.clone(),
                parent: self.issuer.clone(),
            }
        }
    }
}

fn prompt(label: &str) -> Result<SecretString> {
    let value = rpassword::prompt_password(format!("{}: ", label))
        .context("Failed to read passphrase")?;
    Ok(SecretString::new(value))
}

/// Prompt that maps an empty answer to `None`.
fn prompt_optional(label: &str) -> Result<Option<SecretString>> {
    let value = rpassword::prompt_password(format!("{} (empty to skip): ", label))
        .context("Failed to read passphrase")?;
    Ok((!value.is_empty()).then(|| SecretString::new(value)))
}

fn prompt_new(label: &str) -> Result<SecretString> {
    let first = rpassword::prompt_password(format!("New {}: ", label))
        .context("Failed to read passphrase")?;
    let second = rpassword::prompt_password(format!("Repeat {}: ", label))
        .context("Failed to read passphrase")?;
    if first != second {
        bail!("Passphrases do not match");
    }
    Ok(SecretString::new(first))
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = if cli.config.exists() {
        let path = cli.config.to_string_lossy();
        AppConfig::from_file(&path)?
    } else {
        AppConfig::default()
    };
    if let Some(pki_dir) = &cli.pki_dir {
        config.pki_dir = pki_dir.clone();
    }
    Ok(config)
}

fn issuer_of(engine: &LifecycleEngine, entity: &Entity) -> Result<Option<CertificateAuthority>> {
    let Some(parent_id) = entity.parent() else {
        return Ok(None);
    };
    Ok(engine
        .authorities()?
        .into_iter()
        .find(|ca| ca.id == parent_id))
}

/// Passphrase of whoever controls `entity`: its issuer, or itself for roots.
fn controller_passphrases(engine: &LifecycleEngine, entity: &Entity) -> Result<Passphrases> {
    match issuer_of(engine, entity)? {
        Some(issuer) => Ok(Passphrases::parent(prompt(&format!(
            "Passphrase of issuing CA '{}'",
            issuer.name
        ))?)),
        None => match entity {
            Entity::Authority(ca) => Ok(Passphrases::own(prompt(&format!(
                "Passphrase of CA '{}'",
                ca.name
            ))?)),
            Entity::Certificate(cert) if cert.passphrase.is_some() => Ok(Passphrases::own(
                prompt(&format!("Passphrase of '{}'", cert.name))?,
            )),
            Entity::Certificate(_) => Ok(Passphrases::default()),
        },
    }
}

fn print_tree(engine: &LifecycleEngine) -> Result<()> {
    let authorities = engine.authorities()?;
    let certificates = engine.certificates()?;

    fn status(active: bool) -> &'static str {
        if active {
            ""
        } else {
            " [revoked]"
        }
    }

    fn walk(
        parent: EntityId,
        depth: usize,
        authorities: &[CertificateAuthority],
        certificates: &[Certificate],
    ) {
        let indent = "  ".repeat(depth);
        for cert in certificates.iter().filter(|c| c.parent == Some(parent)) {
            println!("{}- {} ({}){}", indent, cert.name, cert.subject.common_name, status(cert.active));
        }
        for ca in authorities.iter().filter(|ca| ca.parent == Some(parent)) {
            println!("{}+ {} [CA]{}", indent, ca.name, status(ca.active));
            walk(ca.id, depth + 1, authorities, certificates);
        }
    }

    for root in authorities.iter().filter(|ca| ca.is_root()) {
        println!("+ {} [root CA]{}", root.name, status(root.active));
        walk(root.id, 1, &authorities, &certificates);
    }
    let self_signed: Vec<_> = certificates.iter().filter(|c| c.parent.is_none()).collect();
    if !self_signed.is_empty() {
        println!("self-signed certificates:");
        for cert in self_signed {
            println!("  - {} ({}){}", cert.name, cert.subject.common_name, status(cert.active));
        }
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let actor = cli
        .actor
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "operator".to_string());
    let mut engine = LifecycleEngine::open(config.clone())
        .with_context(|| format!("Failed to open PKI store at {}", config.pki_dir.display()))?;

    match cli.command {
        Commands::Init => {
            engine.reconcile(&actor)?;
            println!("✓ PKI store ready at {}", config.pki_dir.display());
        }
        Commands::CreateCa {
            name,
            parent,
            subject,
            description,
            key_length,
            days,
            no_subcas,
            policy,
            crl_url,
            extension,
            der,
        } => {
            let mut secrets = Passphrases::own(prompt_new(&format!("passphrase for CA '{}'", name))?);
            if let Some(parent) = &parent {
                secrets = secrets.with_parent(prompt(&format!("Passphrase of issuing CA '{}'", parent))?);
            }
            let request = NewAuthority {
                name,
                description,
                subject: subject.into_subject(&config),
                parent,
                key_length: key_length.unwrap_or(config.default_key_length),
                valid_days: days,
                subcas_allowed: !no_subcas,
                policy: Policy::parse(&policy)?,
                crl_distribution: crl_url,
                extension,
                der_encoded: der,
            };
            let ca = engine.create_authority(request, &secrets, &actor)?;
            println!(
                "✓ CA '{}' created (serial {}, chain: {})",
                ca.name,
                ca.serial.as_deref().unwrap_or("-"),
                ca.ca_chain
            );
        }
        Commands::CreateCert {
            name,
            parent,
            subject,
            description,
            key_length,
            days,
            extension,
            san,
            encrypt_key,
            der,
            pkcs12,
        } => {
            let mut secrets = Passphrases::default();
            if encrypt_key {
                secrets = secrets.with_own(prompt_new(&format!("passphrase for '{}'", name))?);
            }
            if let Some(parent) = &parent {
                secrets = secrets.with_parent(prompt(&format!("Passphrase of issuing CA '{}'", parent))?);
            }
            if pkcs12 {
                secrets = secrets.with_pkcs12(prompt_new("PKCS#12 export passphrase")?);
            }
            let request = NewCertificate {
                name,
                description,
                subject: subject.into_subject(&config),
                parent,
                key_length: key_length.unwrap_or(config.default_key_length),
                valid_days: days,
                extension,
                subject_alt_names: san,
                der_encoded: der,
                pkcs12_encoded: pkcs12,
            };
            let cert = engine.create_certificate(request, &secrets, &actor)?;
            println!(
                "✓ Certificate '{}' created (serial {}, chain: {})",
                cert.name,
                cert.serial.as_deref().unwrap_or("-"),
                cert.ca_chain
            );
        }
        Commands::Update {
            target,
            description,
            der,
            pkcs12,
        } => {
            let target = target.entity_ref();
            let entity = engine.find(&target)?;
            let mut secrets = controller_passphrases(&engine, &entity)?;
            if pkcs12 == Some(true) {
                secrets = secrets.with_pkcs12(prompt_new("PKCS#12 export passphrase")?);
            }
            let changes = UpdateRequest {
                description,
                der_encoded: der,
                pkcs12_encoded: pkcs12,
            };
            engine.update(&target, changes, &secrets, &actor)?;
            println!("✓ {} updated", target);
        }
        Commands::Renew { target, days } => {
            let target = target.entity_ref();
            let entity = engine.find(&target)?;
            let mut secrets = match issuer_of(&engine, &entity)? {
                Some(issuer) => Passphrases::parent(prompt(&format!(
                    "Passphrase of issuing CA '{}'",
                    issuer.name
                ))?),
                None => Passphrases::default(),
            };
            match &entity {
                Entity::Authority(ca) => {
                    secrets = secrets.with_own(prompt(&format!("Passphrase of CA '{}'", ca.name))?);
                }
                Entity::Certificate(cert) => {
                    if cert.passphrase.is_some() {
                        secrets = secrets.with_own(prompt(&format!("Passphrase of '{}'", cert.name))?);
                    }
                    if cert.pkcs12_encoded {
                        if let Some(pass) = prompt_optional("PKCS#12 export passphrase")? {
                            secrets = secrets.with_pkcs12(pass);
                        }
                    }
                }
            }
            let renewed = engine.renew(&target, days, &secrets, &actor)?;
            println!(
                "✓ {} renewed (serial {})",
                target,
                renewed.base().serial().unwrap_or("-")
            );
        }
        Commands::Revoke { target } => {
            let target = target.entity_ref();
            let entity = engine.find(&target)?;
            let Some(issuer) = issuer_of(&engine, &entity)? else {
                bail!("{} is self-signed; delete it instead", target);
            };
            let secrets = Passphrases::parent(prompt(&format!(
                "Passphrase of issuing CA '{}'",
                issuer.name
            ))?);
            engine.revoke(&target, &secrets, &actor)?;
            println!("✓ {} revoked", target);
        }
        Commands::Delete { target } => {
            let target = target.entity_ref();
            let entity = engine.find(&target)?;
            let secrets = controller_passphrases(&engine, &entity)?;
            engine.delete(&target, &secrets, &actor)?;
            println!("✓ {} deleted", target);
        }
        Commands::List => print_tree(&engine)?,
        Commands::Show { target } => {
            print!("{}", engine.show(&target.entity_ref())?);
        }
        Commands::Chain { target } => {
            for (depth, link) in engine.ancestor_chain(&target.entity_ref())?.iter().enumerate() {
                println!("{}{} {}", "  ".repeat(depth), link.name, link.subject);
            }
        }
        Commands::History { target } => {
            for entry in engine.changelog(&target.entity_ref())? {
                println!(
                    "{} {} {} by {}",
                    entry.action_time.to_rfc3339(),
                    entry.action.as_str(),
                    entry.entity_name,
                    entry.actor
                );
                for line in entry.changes.lines() {
                    println!("    {}", line);
                }
            }
        }
        Commands::Bundle {
            target,
            output,
            with_key,
        } => {
            let capability = if with_key {
                DownloadCapability::with_private_key()
            } else {
                DownloadCapability::default()
            };
            let file = File::create(&output)
                .with_context(|| format!("Failed to create {}", output.display()))?;
            let entries = engine.bundle(&target.entity_ref(), capability, BufWriter::new(file))?;
            println!("✓ {} files written to {}", entries.len(), output.display());
        }
        Commands::Profiles { command } => run_profiles(&mut engine, command, &actor)?,
    }
    Ok(())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn run_profiles(engine: &mut LifecycleEngine, command: ProfileCommands, actor: &str) -> Result<()> {
    match command {
        ProfileCommands::List => {
            for profile in engine.extension_profiles()? {
                println!(
                    "{:<20} {:<10} {} [{}]",
                    profile.name,
                    profile.class.as_str(),
                    profile.basic_constraints,
                    profile.key_usage.join(",")
                );
            }
        }
        ProfileCommands::Create {
            name,
            class,
            basic_constraints,
            key_usage,
            extended_key_usage,
            description,
            no_crl_distribution,
        } => {
            let profile = X509Extension {
                id: 0,
                name,
                description,
                class: ExtensionClass::parse(&class)?,
                basic_constraints,
                basic_constraints_critical: true,
                key_usage: split_list(&key_usage),
                key_usage_critical: true,
                extended_key_usage: split_list(&extended_key_usage),
                extended_key_usage_critical: false,
                subject_key_identifier: "hash".to_string(),
                authority_key_identifier: "keyid:always,issuer".to_string(),
                crl_distribution_point: !no_crl_distribution,
                created: None,
            };
            let profile = engine.create_extension_profile(profile, actor)?;
            println!("✓ Extension profile '{}' created", profile.name);
        }
        ProfileCommands::Delete { name } => {
            engine.delete_extension_profile(&name, actor)?;
            println!("✓ Extension profile '{}' deleted", name);
        }
    }
    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("pki_tree=info".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("✗ {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::path::Path;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_target_ref() {
        let cli = Cli::parse_from(["pki-tree", "revoke", "www", "--issuer", "Sub_CA"]);
        let Commands::Revoke { target } = cli.command else {
            panic!("expected revoke");
        };
        assert_eq!(
            target.entity_ref(),
            EntityRef::Certificate {
                name: "www".to_string(),
                parent: Some("Sub_CA".to_string())
            }
        );

        let cli = Cli::parse_from(["pki-tree", "show", "Root_CA", "--ca"]);
        let Commands::Show { target } = cli.command else {
            panic!("expected show");
        };
        assert_eq!(target.entity_ref(), EntityRef::Authority("Root_CA".to_string()));
    }

    #[test]
    fn test_split_list_drops_blanks() {
        assert_eq!(
            split_list("digitalSignature, keyEncipherment,,"),
            ["digitalSignature", "keyEncipherment"]
        );
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let cli = Cli::parse_from([
            "pki-tree",
            "--config",
            "/nonexistent/pki.toml",
            "--pki-dir",
            "/tmp/pki-test",
            "list",
        ]);
        let config = load_config(&cli).unwrap();
        assert_eq!(config.pki_dir, Path::new("/tmp/pki-test"));
    }
}
