#![forbid(unsafe_code)]

use anyhow::{Result, anyhow};
use clap::Parser;
use log::{info, error, LevelFilter};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::{env, fmt, fs, path::Path};
use fs_mistrust::Mistrust;
use std::os::unix::fs::PermissionsExt;
use lazy_static::lazy_static;

use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;

// IWA Utilities
use crate::utils::{iwa_utils::{self, get_absolute_path, redact}, errors::Errors};

// ***************************************************************************
//                                Constants
// ***************************************************************************
// Directory and file locations. Unless otherwise noted, all files and directories
// are relative to the root directory.
const ENV_IWA_ROOT_DIR     : &str = "IWA_ROOT_DIR";
const DEFAULT_ROOT_DIR     : &str = "~/.iwa";
const CONFIG_DIR           : &str = "/config";
const LOGS_DIR             : &str = "/logs";
const CERTS_DIR            : &str = "/certs";
const LOG4RS_CONFIG_FILE   : &str = "/log4rs.yml"; // relative to config dir
const IWA_CONFIG_FILE      : &str = "/iwa.toml";   // relative to config dir

// Connection strings can be injected without writing them to iwa.toml.
// The key is upper-cased and dashes become underscores, so the key
// "mydb-sql-login" is read from IWA_CONNECTION_STRING_MYDB_SQL_LOGIN.
const ENV_CONNECTION_STRING_PREFIX: &str = "IWA_CONNECTION_STRING_";

// Networking.
const DEFAULT_HTTP_ADDR    : &str = "https://localhost";
const DEFAULT_HTTP_PORT    : u16  = 3000;

// Trusted header authentication defaults.
pub const DEFAULT_USER_HEADER   : &str = "X-Remote-User";
pub const DEFAULT_METHOD_HEADER : &str = "X-Remote-Auth-Type";
pub const DEFAULT_AUTH_METHOD   : &str = "Negotiate";

// Console logging pattern used when no log4rs.yml exists.
const FALLBACK_LOG_PATTERN : &str = "{d(%Y-%m-%dT%H:%M:%S%.3f)} {h({l})} {t} - {m}{n}";

// ***************************************************************************
//                             Static Variables
// ***************************************************************************
// Assign the command line arguments BEFORE the runtime context is initialized in main.
lazy_static! {
    pub static ref IWA_ARGS: IwaArgs = init_iwa_args();
}

// ***************************************************************************
//                             Directory Structs
// ***************************************************************************
// ---------------------------------------------------------------------------
// IwaDirs:
// ---------------------------------------------------------------------------
#[derive(Debug)]
#[allow(dead_code)]
pub struct IwaDirs {
    pub root_dir: String,
    pub config_dir: String,
    pub logs_dir: String,
    pub certs_dir: String,
}

// ***************************************************************************
//                               Config Structs
// ***************************************************************************
// ---------------------------------------------------------------------------
// IwaArgs:
// ---------------------------------------------------------------------------
#[derive(Debug, Parser)]
#[command(name = "iwa_server", about = "Command line arguments for the IWA test server.")]
pub struct IwaArgs {
    /// Specify the server's root data directory.
    ///
    /// This directory contains the config, logs and certs directories.
    #[arg(short, long)]
    pub root_dir: Option<String>,

    /// Create the data directories and then exit.
    ///
    /// The data directories will be rooted at a root directory calculated
    /// using the following priority order:
    ///
    ///   1. If set, the value of the IWA_ROOT_DIR environment,
    ///
    ///   2. Otherwise, if set, the value of the --root-dir command line argument,
    ///
    ///   3. Otherwise, ~/.iwa
    #[arg(short, long)]
    pub create_dirs_only: bool,

    /// Print the hash of a Basic authentication secret and exit.
    ///
    /// The output is what goes into the secret_hash field of an [[auth.users]]
    /// entry in iwa.toml.
    #[arg(long, value_name = "SECRET")]
    pub hash_secret: Option<String>,
}

// ---------------------------------------------------------------------------
// Parms:
// ---------------------------------------------------------------------------
#[derive(Debug)]
#[allow(dead_code)]
pub struct Parms {
    pub config_file: String,
    pub config: Config,
}

// ---------------------------------------------------------------------------
// RuntimeCtx:
// ---------------------------------------------------------------------------
#[derive(Debug)]
pub struct RuntimeCtx {
    pub parms: Parms,
    pub iwa_args: &'static IwaArgs,
    pub iwa_dirs: IwaDirs,
}

// ---------------------------------------------------------------------------
// Config:
// ---------------------------------------------------------------------------
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub title: String,
    pub http_addr: String,
    pub http_port: u16,
    pub tls: bool,
    pub connection_strings: BTreeMap<String, ConnectionString>,
    pub auth: AuthConfig,
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /** Look up a named connection string. */
    pub fn connection_string(&self, key: &str) -> Result<&ConnectionString, Errors> {
        self.connection_strings
            .get(key)
            .ok_or_else(|| Errors::MissingConnectionString(key.to_string()))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            title: "IWA Test Server".to_string(),
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            http_port: DEFAULT_HTTP_PORT,
            tls: true,
            connection_strings: BTreeMap::new(),
            auth: AuthConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// ConnectionString:
// ---------------------------------------------------------------------------
/** A database URL.  It usually carries credentials, so Debug output only
 * shows its scheme.
 */
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct ConnectionString(String);

impl ConnectionString {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", redact(&self.0))
    }
}

// ---------------------------------------------------------------------------
// AuthConfig:
// ---------------------------------------------------------------------------
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Present only when a trusted front end authenticates for us.
    pub trusted_header: Option<TrustedHeaderConfig>,
    pub users: Vec<BasicUser>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrustedHeaderConfig {
    pub user_header: String,
    pub method_header: String,
    pub default_method: String,
}

impl Default for TrustedHeaderConfig {
    fn default() -> Self {
        Self {
            user_header: DEFAULT_USER_HEADER.to_string(),
            method_header: DEFAULT_METHOD_HEADER.to_string(),
            default_method: DEFAULT_AUTH_METHOD.to_string(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct BasicUser {
    pub name: String,
    pub secret_hash: String,
}

impl fmt::Debug for BasicUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicUser")
            .field("name", &self.name)
            .field("secret_hash", &"<redacted>")
            .finish()
    }
}

// ***************************************************************************
//                            Directory Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_iwa_args:
// ---------------------------------------------------------------------------
/** Get the command line arguments. */
fn init_iwa_args() -> IwaArgs {
    IwaArgs::parse()
}

// ---------------------------------------------------------------------------
// init_iwa_dirs:
// ---------------------------------------------------------------------------
/** Calculate the external data directories, creating any that are missing. */
pub fn init_iwa_dirs(args: &IwaArgs) -> Result<IwaDirs> {
    let mistrust = get_mistrust()?;

    let root_dir = get_root_dir(args);
    check_iwa_dir(&root_dir, "root directory", &mistrust)?;

    let config_dir = root_dir.clone() + CONFIG_DIR;
    check_iwa_dir(&config_dir, "config directory", &mistrust)?;

    let logs_dir = root_dir.clone() + LOGS_DIR;
    check_iwa_dir(&logs_dir, "logs directory", &mistrust)?;

    let certs_dir = root_dir.clone() + CERTS_DIR;
    check_iwa_dir(&certs_dir, "certs directory", &mistrust)?;

    Ok(IwaDirs { root_dir, config_dir, logs_dir, certs_dir })
}

// ---------------------------------------------------------------------------
// check_iwa_dir:
// ---------------------------------------------------------------------------
/** Check that the path is absolute and, if it exists, that is has the proper
 * permissions assigned.  If it doesn't exist, create it.  The mistrust package
 * creates directories with 0o700 permissions.
 */
fn check_iwa_dir(dir: &str, msgname: &str, mistrust: &Mistrust) -> Result<()> {
    let path = Path::new(dir);
    if !path.is_absolute() {
        return Err(Errors::DirectoryCheck(format!("the {} path must be absolute: {}", msgname, dir)).into());
    }
    if path.exists() {
        if !path.is_dir() {
            return Err(Errors::DirectoryCheck(format!("the {} path must be a directory: {}", msgname, dir)).into());
        }

        // Owner only rwx.
        let perm = path.metadata()?.permissions().mode();
        if perm & 0o777 != 0o700 {
            return Err(Errors::DirectoryCheck(
                format!("the {} path must have 0o700 permissions: {}", msgname, dir)).into());
        }
    } else {
        mistrust.make_directory(path).map_err(|e| {
            Errors::DirectoryCheck(format!("make directory error for {}: {}", dir, e))
        })?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// get_mistrust:
// ---------------------------------------------------------------------------
/** Configure a new mistrust object for initial directory processing. */
fn get_mistrust() -> Result<Mistrust> {
    Mistrust::builder()
        .ignore_prefix(get_absolute_path("~"))
        .trust_group(0)
        .build()
        .map_err(|e| anyhow!("Mistrust configuration error: {}", e))
}

// ---------------------------------------------------------------------------
// get_root_dir:
// ---------------------------------------------------------------------------
fn get_root_dir(args: &IwaArgs) -> String {
    // Order of precedence:
    //  1. Environment variable
    //  2. Command line --root-dir argument
    //  3. Default location
    let root_dir = env::var(ENV_IWA_ROOT_DIR).unwrap_or_else(|_| {
        args.root_dir.clone().unwrap_or_else(|| DEFAULT_ROOT_DIR.to_string())
    });

    get_absolute_path(&root_dir)
}

// ***************************************************************************
//                               Log Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_log:
// ---------------------------------------------------------------------------
/** Initialize log4rs from the config directory's log4rs.yml.  Without that
 * file everything at info and above goes to the console.
 */
pub fn init_log(dirs: &IwaDirs) -> Result<()> {
    let logconfig = dirs.config_dir.clone() + LOG4RS_CONFIG_FILE;
    if Path::new(&logconfig).exists() {
        log4rs::init_file(&logconfig, Default::default()).map_err(|e| {
            eprintln!("{}", e);
            Errors::Log4rsInitialization(logconfig.clone())
        })?;
        info!("Log4rs initialized using: {}", logconfig);
    } else {
        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(FALLBACK_LOG_PATTERN)))
            .build();
        let config = LogConfig::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(LevelFilter::Info))
            .map_err(|e| Errors::Log4rsInitialization(e.to_string()))?;
        log4rs::init_config(config).map_err(|e| Errors::Log4rsInitialization(e.to_string()))?;
        info!("Log4rs configuration {} not found, logging to console.", logconfig);
    }
    Ok(())
}

// ***************************************************************************
//                             Parms Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// get_parms:
// ---------------------------------------------------------------------------
/** Retrieve the application parameters from the configuration file in the
 * config directory.  If the file cannot be read, default values are used.
 */
fn get_parms(dirs: &IwaDirs) -> Result<Parms> {
    let config_file = dirs.config_dir.clone() + IWA_CONFIG_FILE;

    let config_file_abs = iwa_utils::get_absolute_path(&config_file);
    info!("{}", Errors::ReadingConfigFile(config_file_abs.clone()));
    let contents = match fs::read_to_string(&config_file_abs) {
        Ok(c) => c,
        Err(_) => {
            info!("Unable to read configuration at {}. Using default values.", config_file);
            let mut config = Config::new();
            apply_env_overrides(&mut config, env::vars());
            return Ok(Parms { config_file: Default::default(), config });
        }
    };

    let mut config = parse_config(&contents, &config_file_abs)?;
    apply_env_overrides(&mut config, env::vars());
    Ok(Parms { config_file: config_file_abs, config })
}

// ---------------------------------------------------------------------------
// parse_config:
// ---------------------------------------------------------------------------
fn parse_config(contents: &str, config_file: &str) -> Result<Config> {
    match toml::from_str(contents) {
        Ok(c) => Ok(c),
        Err(e) => {
            let msg = format!("{}\n   {}", Errors::TOMLParseError(config_file.to_string()), e);
            error!("{}", msg);
            Err(anyhow!(msg))
        }
    }
}

// ---------------------------------------------------------------------------
// apply_env_overrides:
// ---------------------------------------------------------------------------
/** Environment connection strings replace configured ones with the same key.
 * Keys that only exist in the environment are added in lower case.
 */
fn apply_env_overrides(config: &mut Config, vars: impl Iterator<Item = (String, String)>) {
    for (name, value) in vars {
        let Some(suffix) = name.strip_prefix(ENV_CONNECTION_STRING_PREFIX) else {
            continue;
        };
        if suffix.is_empty() {
            continue;
        }
        let existing = config
            .connection_strings
            .keys()
            .find(|k| env_key_suffix(k) == suffix)
            .cloned();
        let key = existing.unwrap_or_else(|| suffix.to_lowercase().replace('_', "-"));
        info!("Connection string '{}' taken from environment variable {}.", key, name);
        config.connection_strings.insert(key, ConnectionString::new(value));
    }
}

fn env_key_suffix(key: &str) -> String {
    key.to_uppercase().replace('-', "_")
}

// ***************************************************************************
//                             Config Functions
// ***************************************************************************
// ---------------------------------------------------------------------------
// init_runtime_context:
// ---------------------------------------------------------------------------
/** Establish the data directories, logging and configuration.  Any failure
 * aborts startup.
 */
pub fn init_runtime_context() -> Result<RuntimeCtx> {
    let iwa_dirs = init_iwa_dirs(&IWA_ARGS)?;
    init_log(&iwa_dirs)?;
    let parms = get_parms(&iwa_dirs)?;
    Ok(RuntimeCtx { parms, iwa_args: &IWA_ARGS, iwa_dirs })
}
