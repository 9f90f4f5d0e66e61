//! cfat: encrypted FAT volume CLI
//!
//! Volume commands:
//!   init                         - create a volume on the configured backend
//!   config show                  - display the active configuration
//!   sync                         - replay any cached changes into the tables
//!
//! File commands (paths are absolute inside the volume):
//!   ls / tree / stat             - inspect the tree
//!   put / cat                    - store and read file content
//!   mkdir / mv / rename / rm     - reshape the tree
//!   chown / perm add / perm rm   - ownership and group grants
//!
//! Account commands:
//!   user add|rm|passwd|list
//!   group add|rm|join|kick|promote|demote|list

mod volume;

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use cfat_core::config::{BackendKind, CfatConfig};
use cfat_crypto::{derive_volume_key, ChunkCipher};
use cfat_fs::{
    prehash, CacheRegistry, DirEntry, Filesystem, FsOptions, GroupId, Permission, UserId,
    ROOT_NAME,
};
use cfat_storage::{Connector, S3Credentials};

use volume::VolumeHeader;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "cfat",
    version,
    about = "Encrypted FAT volume client",
    long_about = "cfat: store files in an encrypted volume with per-group access control"
)]
struct Cli {
    /// Path to cfat.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "CFAT_CONFIG",
        default_value = "~/.config/cfat/config.toml"
    )]
    config: PathBuf,

    /// Acting user
    #[arg(long, short = 'u', env = "CFAT_USER", default_value = ROOT_NAME)]
    user: String,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(long, env = "CFAT_LOG")]
    log: Option<String>,

    /// Log format; overrides the config
    #[arg(long, env = "CFAT_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new volume; the acting user's password becomes root's
    Init,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Fold cached metadata changes into the backend tables
    Sync,

    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Print every readable entry below a directory
    Tree {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Show an entry's metadata as JSON
    Stat { path: String },

    /// Store a local file, replacing any file at the same path
    Put {
        /// Local file to read
        local: PathBuf,
        /// Destination path in the volume
        path: String,
        /// Grant for a new file, as GROUP:r, GROUP:w or GROUP:rw (repeatable)
        #[arg(long, short = 'g')]
        grant: Vec<String>,
    },

    /// Write a file's content to stdout or a local file
    Cat {
        path: String,
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Create a directory
    Mkdir {
        path: String,
        /// Grant, as GROUP:r, GROUP:w or GROUP:rw (repeatable)
        #[arg(long, short = 'g')]
        grant: Vec<String>,
    },

    /// Move an entry into another directory
    Mv { path: String, dest_dir: String },

    /// Rename an entry in place
    Rename { path: String, name: String },

    /// Remove a file or directory
    Rm {
        path: String,
        /// Remove a directory and everything below it
        #[arg(long, short = 'r')]
        recursive: bool,
    },

    /// Hand an entry to another user
    Chown { path: String, user: String },

    /// Group grants on entries
    Perm {
        #[command(subcommand)]
        action: PermAction,
    },

    /// User management
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Group management
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Subcommand, Debug)]
enum PermAction {
    /// Grant a group access, as GROUP:r, GROUP:w or GROUP:rw
    Add {
        path: String,
        grant: String,
        /// Apply to the whole subtree
        #[arg(long, short = 'r')]
        recursive: bool,
    },
    /// Drop a group's grant
    Rm { path: String, group: String },
}

#[derive(Subcommand, Debug)]
enum UserAction {
    Add { name: String },
    Rm { name: String },
    /// Change a password (default: the acting user's)
    Passwd { name: Option<String> },
    List,
}

#[derive(Subcommand, Debug)]
enum GroupAction {
    Add { name: String },
    Rm { name: String },
    Join { group: String, user: String },
    Kick { group: String, user: String },
    Promote { group: String, user: String },
    Demote { group: String, user: String },
    List,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cfat_core::config::expand_home(&cli.config);
    let config = CfatConfig::load(&config_path)?;
    config.validate()?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.clone().unwrap_or(match config.log.format.as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    });
    init_logging(&level, &format);
    debug!(config = %config_path.display(), user = %cli.user, "cfat starting");

    match cli.command {
        Commands::Init => cmd_init(&config, &cli.user),
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &config_path),
        command => {
            let session = Session::open(&config, &cli.user)?;
            let result = run(&session, command);
            // sync even when the command failed; an earlier step may have landed
            let closed = session.fs.close().context("syncing metadata");
            result.and(closed)
        }
    }
}

fn init_logging(level: &str, format: &LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries file content for `cat`
    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(io::stderr))
                .init();
        }
    }
}

fn run(s: &Session, command: Commands) -> Result<()> {
    match command {
        Commands::Init | Commands::Config { .. } => bail!("command does not run in a session"),
        Commands::Sync => {
            let pending = s.fs.pending_changes();
            s.fs.sync()?;
            println!("synced {pending} cached change(s)");
            Ok(())
        }
        Commands::Ls { path } => cmd_ls(s, &path),
        Commands::Tree { path } => cmd_tree(s, &path),
        Commands::Stat { path } => {
            let entry = s.fs.lookup(s.user, &path)?;
            let entry = s.fs.entry(s.user, &entry.id)?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
            Ok(())
        }
        Commands::Put { local, path, grant } => cmd_put(s, &local, &path, &grant),
        Commands::Cat { path, output } => cmd_cat(s, &path, output.as_deref()),
        Commands::Mkdir { path, grant } => {
            let (parent, name) = split_path(&path)?;
            let parent = s.fs.lookup(s.user, parent)?;
            let grants = s.parse_grants(&grant)?;
            s.fs.mkdir(s.user, name, &parent.id, &grants)?;
            Ok(())
        }
        Commands::Mv { path, dest_dir } => {
            let entry = s.fs.lookup(s.user, &path)?;
            let dest = s.fs.lookup(s.user, &dest_dir)?;
            s.fs.move_entry(s.user, &entry.id, &dest.id)?;
            Ok(())
        }
        Commands::Rename { path, name } => {
            let entry = s.fs.lookup(s.user, &path)?;
            s.fs.rename(s.user, &entry.id, &name)?;
            Ok(())
        }
        Commands::Rm { path, recursive } => {
            let entry = s.fs.lookup(s.user, &path)?;
            s.fs.remove(s.user, &entry.id, recursive)?;
            Ok(())
        }
        Commands::Chown { path, user } => {
            let entry = s.fs.lookup(s.user, &path)?;
            let owner = s.user_id(&user)?;
            s.fs.chown(s.user, &entry.id, owner)?;
            Ok(())
        }
        Commands::Perm { action } => cmd_perm(s, action),
        Commands::User { action } => cmd_user(s, action),
        Commands::Group { action } => cmd_group(s, action),
    }
}

// ── Session: backend, volume key, login ──────────────────────────────────────

struct Session {
    fs: Filesystem,
    user: UserId,
}

impl Session {
    fn open(config: &CfatConfig, user: &str) -> Result<Self> {
        let conn = connect(config)?;
        let header = VolumeHeader::load(&*conn)?.ok_or_else(|| {
            anyhow!(
                "no cfat volume on {}\n\
                 Create one with `cfat init`.",
                conn.identity()
            )
        })?;
        let mut opts = FsOptions::from_config(config);
        header.apply(&mut opts);

        let passphrase = secret("CFAT_PASSPHRASE", "volume passphrase: ")?;
        let key = derive_volume_key(&passphrase, &header.salt()?, &header.kdf())?;
        let fs = Filesystem::open(
            conn,
            ChunkCipher::new(&key),
            header.base_iv,
            opts,
            &CacheRegistry::new(),
        )
        .map_err(|e| {
            if e.is_corrupt() {
                anyhow!(e).context("cannot read volume metadata (wrong passphrase?)")
            } else {
                anyhow!(e)
            }
        })?;

        let password = secret("CFAT_PASSWORD", &format!("password for {user}: "))?;
        let uid = fs
            .authenticate(user, &prehash(user, password.expose_secret()))
            .with_context(|| format!("logging in as {user}"))?;
        info!(user, backend = fs.identity(), "logged in");
        Ok(Session { fs, user: uid })
    }

    fn user_id(&self, name: &str) -> Result<UserId> {
        self.fs
            .user_by_name(name)
            .map(|u| u.id)
            .ok_or_else(|| anyhow!("no such user: {name}"))
    }

    fn group_id(&self, name: &str) -> Result<GroupId> {
        self.fs
            .group_by_name(name)
            .map(|g| g.id)
            .ok_or_else(|| anyhow!("no such group: {name}"))
    }

    fn parse_grants(&self, grants: &[String]) -> Result<Vec<Permission>> {
        grants
            .iter()
            .map(|g| {
                let (group, read, write) = parse_grant(g)?;
                Ok(Permission::new(self.group_id(group)?, read, write))
            })
            .collect()
    }
}

fn connect(config: &CfatConfig) -> Result<std::sync::Arc<dyn Connector>> {
    let creds = if config.storage.backend == BackendKind::S3 {
        Some(s3_credentials_from_env()?)
    } else {
        None
    };
    cfat_storage::connect(&config.storage, creds.as_ref()).context("building storage connector")
}

/// S3 credentials from AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY.
fn s3_credentials_from_env() -> Result<S3Credentials> {
    let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
        .or_else(|_| std::env::var("CFAT_ACCESS_KEY_ID"))
        .context(
            "S3 credentials not set\n\
             Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY environment variables.",
        )?;
    let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
        .or_else(|_| std::env::var("CFAT_SECRET_ACCESS_KEY"))
        .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
    Ok(S3Credentials {
        access_key_id,
        secret_access_key,
    })
}

/// A secret from the environment, else prompted on the terminal.
fn secret(var: &str, prompt: &str) -> Result<SecretString> {
    if let Ok(value) = std::env::var(var) {
        return Ok(SecretString::from(value));
    }
    let value = rpassword::prompt_password(prompt).with_context(|| format!("reading {var}"))?;
    Ok(SecretString::from(value))
}

// ── `cfat init` / `cfat config show` ──────────────────────────────────────────

fn cmd_init(config: &CfatConfig, user: &str) -> Result<()> {
    if user != ROOT_NAME {
        bail!("a new volume is always created by {ROOT_NAME}");
    }
    let conn = connect(config)?;
    conn.prepare().context("preparing backend")?;
    if VolumeHeader::load(&*conn)?.is_some() {
        bail!("{} already holds a cfat volume", conn.identity());
    }

    let mut opts = FsOptions::from_config(config);
    let header = VolumeHeader::generate(&opts);
    header.apply(&mut opts);

    let passphrase = secret("CFAT_PASSPHRASE", "new volume passphrase: ")?;
    if std::env::var("CFAT_PASSPHRASE").is_err() {
        let again = secret("CFAT_PASSPHRASE", "repeat passphrase: ")?;
        if again.expose_secret() != passphrase.expose_secret() {
            bail!("passphrases do not match");
        }
    }
    let password = secret("CFAT_PASSWORD", "password for root: ")?;

    let key = derive_volume_key(&passphrase, &header.salt()?, &header.kdf())?;
    header.store(&*conn)?;
    let identity = conn.identity();
    let fs = Filesystem::create(
        conn,
        ChunkCipher::new(&key),
        header.base_iv,
        opts,
        &CacheRegistry::new(),
        &prehash(ROOT_NAME, password.expose_secret()),
    )?;
    fs.close()?;
    println!("created volume on {identity}");
    Ok(())
}

fn cmd_config_show(config: &CfatConfig, path: &Path) -> Result<()> {
    println!("# config: {}", path.display());
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

// ── tree commands ─────────────────────────────────────────────────────────────

fn cmd_ls(s: &Session, path: &str) -> Result<()> {
    let dir = s.fs.lookup(s.user, path)?;
    let names = s.user_names();
    let mut out = io::stdout().lock();
    for entry in s.fs.list(s.user, &dir.id)? {
        writeln!(out, "{}", ls_line(&entry, &names))?;
    }
    Ok(())
}

fn cmd_tree(s: &Session, path: &str) -> Result<()> {
    let dir = s.fs.lookup(s.user, path)?;
    let mut out = io::stdout().lock();
    for (path, entry) in s.fs.walk(s.user, &dir.id)? {
        let suffix = if entry.is_dir() { "/" } else { "" };
        writeln!(out, "{path}{suffix}")?;
    }
    Ok(())
}

fn cmd_put(s: &Session, local: &Path, path: &str, grant: &[String]) -> Result<()> {
    let (parent, name) = split_path(path)?;
    let parent = s.fs.lookup(s.user, parent)?;
    let grants = s.parse_grants(grant)?;
    let file = File::open(local).with_context(|| format!("opening {}", local.display()))?;
    let id = s.fs.put(s.user, name, &parent.id, file, &grants)?;
    let entry = s.fs.entry(s.user, &id)?;
    println!("{path}: {} bytes", entry.size);
    Ok(())
}

fn cmd_cat(s: &Session, path: &str, output: Option<&Path>) -> Result<()> {
    let entry = s.fs.lookup(s.user, path)?;
    let mut reader = s.fs.read(s.user, &entry.id)?;
    match output {
        Some(dest) => {
            let mut file =
                File::create(dest).with_context(|| format!("creating {}", dest.display()))?;
            io::copy(&mut reader, &mut file)?;
            file.sync_all()?;
        }
        None => {
            let mut out = io::stdout().lock();
            io::copy(&mut reader, &mut out)?;
            out.flush()?;
        }
    }
    Ok(())
}

fn cmd_perm(s: &Session, action: PermAction) -> Result<()> {
    match action {
        PermAction::Add {
            path,
            grant,
            recursive,
        } => {
            let entry = s.fs.lookup(s.user, &path)?;
            let (group, read, write) = parse_grant(&grant)?;
            let perm = Permission::new(s.group_id(group)?, read, write);
            s.fs.add_permission(s.user, &entry.id, perm, recursive)?;
        }
        PermAction::Rm { path, group } => {
            let entry = s.fs.lookup(s.user, &path)?;
            s.fs.remove_permission(s.user, &entry.id, s.group_id(&group)?)?;
        }
    }
    Ok(())
}

// ── account commands ──────────────────────────────────────────────────────────

fn cmd_user(s: &Session, action: UserAction) -> Result<()> {
    match action {
        UserAction::Add { name } => {
            let password = secret("CFAT_NEW_PASSWORD", &format!("password for {name}: "))?;
            let id = s
                .fs
                .add_user(s.user, &name, &prehash(&name, password.expose_secret()))?;
            println!("added user {name} ({id})");
        }
        UserAction::Rm { name } => {
            s.fs.remove_user(s.user, s.user_id(&name)?)?;
        }
        UserAction::Passwd { name } => {
            let target = match name {
                Some(name) => name,
                None => s
                    .fs
                    .users()
                    .into_iter()
                    .find(|u| u.id == s.user)
                    .map(|u| u.name)
                    .ok_or_else(|| anyhow!("acting user no longer exists"))?,
            };
            let password = secret("CFAT_NEW_PASSWORD", &format!("new password for {target}: "))?;
            s.fs.set_password(
                s.user,
                s.user_id(&target)?,
                &prehash(&target, password.expose_secret()),
            )?;
        }
        UserAction::List => {
            for user in s.fs.users() {
                println!("{:>5}  {}", user.id, user.name);
            }
        }
    }
    Ok(())
}

fn cmd_group(s: &Session, action: GroupAction) -> Result<()> {
    match action {
        GroupAction::Add { name } => {
            let id = s.fs.add_group(s.user, &name)?;
            println!("added group {name} ({id})");
        }
        GroupAction::Rm { name } => s.fs.remove_group(s.user, s.group_id(&name)?)?,
        GroupAction::Join { group, user } => {
            s.fs.join_group(s.user, s.user_id(&user)?, s.group_id(&group)?)?
        }
        GroupAction::Kick { group, user } => {
            s.fs.kick_user(s.user, s.user_id(&user)?, s.group_id(&group)?)?
        }
        GroupAction::Promote { group, user } => {
            s.fs.promote_user(s.user, s.user_id(&user)?, s.group_id(&group)?)?
        }
        GroupAction::Demote { group, user } => {
            s.fs.demote_user(s.user, s.user_id(&user)?, s.group_id(&group)?)?
        }
        GroupAction::List => {
            let names = s.user_names();
            for group in s.fs.groups() {
                let members: Vec<String> = group
                    .members
                    .iter()
                    .map(|id| {
                        let name = names.get(id).map(String::as_str).unwrap_or("?");
                        if group.is_admin(*id) {
                            format!("{name}*")
                        } else {
                            name.to_string()
                        }
                    })
                    .collect();
                println!("{:>5}  {:<16} {}", group.id, group.name, members.join(" "));
            }
        }
    }
    Ok(())
}

impl Session {
    fn user_names(&self) -> HashMap<UserId, String> {
        self.fs.users().into_iter().map(|u| (u.id, u.name)).collect()
    }
}

// ── helpers ───────────────────────────────────────────────────────────────────

/// Split `/a/b/c` into `("/a/b", "c")`.
fn split_path(path: &str) -> Result<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) if !name.is_empty() => {
            Ok((if parent.is_empty() { "/" } else { parent }, name))
        }
        None if !trimmed.is_empty() => Ok(("/", trimmed)),
        _ => bail!("path has no final component: {path:?}"),
    }
}

/// `GROUP:r`, `GROUP:w` or `GROUP:rw`; a bare `GROUP` means read.
fn parse_grant(spec: &str) -> Result<(&str, bool, bool)> {
    let (group, mode) = spec.rsplit_once(':').unwrap_or((spec, "r"));
    if group.is_empty() {
        bail!("grant {spec:?} names no group");
    }
    let (read, write) = match mode {
        "r" => (true, false),
        "w" => (false, true),
        "rw" | "wr" => (true, true),
        other => bail!("unknown access mode {other:?} in grant {spec:?}"),
    };
    Ok((group, read, write))
}

fn ls_line(entry: &DirEntry, names: &HashMap<UserId, String>) -> String {
    let kind = if entry.is_dir() { 'd' } else { '-' };
    let owner = names.get(&entry.owner).map(String::as_str).unwrap_or("?");
    let grants = entry.permissions.len();
    let suffix = if entry.is_dir() { "/" } else { "" };
    format!(
        "{kind} {owner:<12} {grants:>2}g {size:>12}  {name}{suffix}",
        size = entry.size,
        name = entry.name,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfat_fs::{DirentId, ROOT_USER};

    #[test]
    fn test_split_path() {
        assert_eq!(split_path("/a/b/c").unwrap(), ("/a/b", "c"));
        assert_eq!(split_path("/top").unwrap(), ("/", "top"));
        assert_eq!(split_path("top").unwrap(), ("/", "top"));
        assert_eq!(split_path("/a/dir/").unwrap(), ("/a", "dir"));
        assert!(split_path("/").is_err());
        assert!(split_path("").is_err());
    }

    #[test]
    fn test_parse_grant() {
        assert_eq!(parse_grant("team:rw").unwrap(), ("team", true, true));
        assert_eq!(parse_grant("team:w").unwrap(), ("team", false, true));
        assert_eq!(parse_grant("team").unwrap(), ("team", true, false));
        assert!(parse_grant(":rw").is_err());
        assert!(parse_grant("team:x").is_err());
    }

    #[test]
    fn test_ls_line() {
        let dir = DirEntry::new_dir(DirentId::from("d1"), "docs", DirentId::root(), ROOT_USER);
        let names = HashMap::from([(ROOT_USER, ROOT_NAME.to_string())]);
        let line = ls_line(&dir, &names);
        assert!(line.starts_with("d root"));
        assert!(line.ends_with("docs/"));
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from(["cfat", "-u", "alice", "rm", "-r", "/old"]).unwrap();
        assert_eq!(cli.user, "alice");
        assert!(matches!(
            cli.command,
            Commands::Rm { recursive: true, ref path } if path == "/old"
        ));
    }
}
