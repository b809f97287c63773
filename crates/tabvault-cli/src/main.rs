use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::io::Write;
use std::path::{Path, PathBuf};
use tabvault_core::audit::ChainCheck;
use tabvault_core::config::{Secrets, ENV_MASTER_PASSWORD};
use tabvault_core::{ColumnDef, ColumnType, Record, Role, TabVault, VaultConfig};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(name = "tabvault", author, version, about = "Encrypted, role-controlled table store", long_about = None)]
struct Cli {
    /// Directory holding the encrypted stores
    #[arg(long, global = true, env = "TABVAULT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Session token from `tabvault login`
    #[arg(long, global = true, env = "TABVAULT_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the salt and the root account on first run
    Init,

    /// Authenticate and print a session token
    Login { email: String },

    /// Revoke the current session token
    Logout,

    /// Change your own password
    Passwd,

    /// Manage user accounts
    Users {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Manage column schemas
    Schema {
        #[command(subcommand)]
        command: SchemaCommands,
    },

    /// Read and modify records
    Records {
        #[command(subcommand)]
        command: RecordCommands,
    },

    /// Inspect the audit trail
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },

    /// Re-encrypt every store under a new master password
    Rekey,

    /// Move every store to another directory under a new master password
    Relocate { dir: PathBuf },
}

#[derive(Subcommand, Debug)]
enum UserCommands {
    List,
    Create {
        email: String,
        #[arg(long, default_value = "user")]
        role: Role,
    },
    Delete {
        email: String,
    },
    ResetPassword {
        email: String,
    },
    SetRole {
        email: String,
        role: Role,
    },
}

#[derive(Subcommand, Debug)]
enum SchemaCommands {
    /// Create a schema from `--column name:TYPE` definitions (append `?` to allow nulls)
    Create {
        name: String,
        #[arg(long = "column", required = true)]
        columns: Vec<String>,
    },
    /// Create a schema from a JSON file holding `{"columns": [...]}`
    Import { name: String, file: PathBuf },
    Export { name: String, file: PathBuf },
    List,
    Show { name: String },
    Activate { name: String },
    Active,
}

#[derive(Subcommand, Debug)]
enum RecordCommands {
    List {
        #[arg(long, default_value = "1")]
        page: usize,
        #[arg(long, default_value = "100")]
        page_size: usize,
    },
    /// Add a record given as a JSON object
    Add { json: String },
    /// Merge a JSON object into the record at `index`
    Update { index: usize, json: String },
    Delete { index: usize },
    /// Replace all records with the rows of a JSON array file
    Import { file: PathBuf },
}

#[derive(Subcommand, Debug)]
enum AuditCommands {
    Tail {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    Verify,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let mut config = VaultConfig::from_env()?;
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    debug!(data_dir = %config.data_dir.display(), "configuration loaded");

    match &cli.command {
        Commands::Init => init_command(config),
        command => {
            let vault = TabVault::open(config, master_password()?)?;
            run(&vault, cli.token.as_deref(), command)
        }
    }
}

fn init_command(config: VaultConfig) -> Result<()> {
    let secrets = match Secrets::from_env() {
        Ok(secrets) => secrets,
        Err(_) => {
            let (master, email, password) = Secrets::partial_from_env();
            let master = match master {
                Some(master) => master,
                None => prompt_new_password("Master password")?,
            };
            let email = match email {
                Some(email) => email,
                None => prompt_line("Root email: ")?,
            };
            let password = match password {
                Some(password) => password,
                None => prompt_new_password("Root password")?,
            };
            Secrets::new(&master, &email, &password)
        }
    };
    let data_dir = config.data_dir.clone();
    let vault = TabVault::open(config, secrets.master_password.clone())?;
    let created = vault.bootstrap_root(&secrets.root_email, &secrets.root_password)?;
    print_json(&json!({
        "data_dir": data_dir.display().to_string(),
        "root_created": created,
    }))
}

fn run(vault: &TabVault, token: Option<&str>, command: &Commands) -> Result<()> {
    let require_token =
        || token.ok_or_else(|| anyhow!("no session token; run `tabvault login` and set TABVAULT_TOKEN"));
    match command {
        Commands::Init => Err(anyhow!("init runs before a vault is opened")),
        Commands::Login { email } => {
            let password = prompt_password("Password")?;
            print_json(&vault.authenticate(email, &password)?)
        }
        Commands::Logout => {
            vault.logout(require_token()?)?;
            print_json(&json!({ "logged_out": true }))
        }
        Commands::Passwd => {
            let current = prompt_password("Current password")?;
            let new = prompt_new_password("New password")?;
            vault.change_password(require_token()?, &current, &new)?;
            print_json(&json!({ "changed": true }))
        }
        Commands::Users { command } => users_command(vault, require_token()?, command),
        Commands::Schema { command } => schema_command(vault, require_token()?, command),
        Commands::Records { command } => records_command(vault, require_token()?, command),
        Commands::Audit { command } => match command {
            AuditCommands::Tail { limit } => print_json(&vault.audit_tail(require_token()?, *limit)?),
            AuditCommands::Verify => match vault.verify_audit(require_token()?)? {
                ChainCheck::Intact { entries } => print_json(&json!({ "intact": true, "entries": entries })),
                ChainCheck::Broken { line, reason } => {
                    print_json(&json!({ "intact": false, "line": line, "reason": reason }))
                }
            },
        },
        Commands::Rekey => {
            let new = prompt_new_password("New master password")?;
            let files = vault.rekey(require_token()?, &new)?;
            print_json(&json!({ "reencrypted_files": files }))
        }
        Commands::Relocate { dir } => {
            let new = prompt_new_password("New master password")?;
            let moved = vault.relocate(require_token()?, dir, new)?;
            print_json(&json!({ "data_dir": moved.config().data_dir }))
        }
    }
}

fn users_command(vault: &TabVault, token: &str, command: &UserCommands) -> Result<()> {
    match command {
        UserCommands::List => print_json(&vault.get_users(token)?),
        UserCommands::Create { email, role } => {
            let password = prompt_new_password("Password for new user")?;
            print_json(&vault.create_user(token, email, &password, *role)?)
        }
        UserCommands::Delete { email } => {
            vault.delete_user(token, email)?;
            print_json(&json!({ "deleted": email }))
        }
        UserCommands::ResetPassword { email } => {
            let password = prompt_new_password("New password")?;
            vault.reset_password(token, email, &password)?;
            print_json(&json!({ "reset": email }))
        }
        UserCommands::SetRole { email, role } => print_json(&vault.change_user_role(token, email, *role)?),
    }
}

fn schema_command(vault: &TabVault, token: &str, command: &SchemaCommands) -> Result<()> {
    match command {
        SchemaCommands::Create { name, columns } => {
            let columns = columns
                .iter()
                .map(|spec| parse_column(spec))
                .collect::<Result<Vec<_>>>()?;
            print_json(&vault.create_schema(token, name, columns)?)
        }
        SchemaCommands::Import { name, file } => print_json(&vault.import_schema(token, name, file)?),
        SchemaCommands::Export { name, file } => {
            vault.export_schema(token, name, file)?;
            print_json(&json!({ "exported": name, "file": file.display().to_string() }))
        }
        SchemaCommands::List => print_json(&vault.list_schemas(token)?),
        SchemaCommands::Show { name } => print_json(&vault.get_schema(token, name)?),
        SchemaCommands::Activate { name } => print_json(&vault.set_active_schema(token, name)?),
        SchemaCommands::Active => print_json(&vault.get_active_schema(token)?),
    }
}

fn records_command(vault: &TabVault, token: &str, command: &RecordCommands) -> Result<()> {
    match command {
        RecordCommands::List { page, page_size } => print_json(&vault.get_data(token, *page, *page_size)?),
        RecordCommands::Add { json } => {
            let index = vault.add_record(token, parse_record(json)?)?;
            print_json(&json!({ "index": index }))
        }
        RecordCommands::Update { index, json } => {
            print_json(&vault.update_record(token, *index, parse_record(json)?)?)
        }
        RecordCommands::Delete { index } => print_json(&vault.delete_record(token, *index)?),
        RecordCommands::Import { file } => {
            let rows = read_rows(file)?;
            let imported = vault.import_tabular_file(token, rows)?;
            print_json(&json!({ "imported": imported }))
        }
    }
}

/// `name:TYPE`, with a trailing `?` on the type for a nullable column.
fn parse_column(spec: &str) -> Result<ColumnDef> {
    let (name, kind) = spec
        .split_once(':')
        .ok_or_else(|| anyhow!("column '{spec}' must look like name:TEXT or name:NUMBER?"))?;
    let (kind, nullable) = match kind.strip_suffix('?') {
        Some(kind) => (kind, true),
        None => (kind, false),
    };
    let column_type = match kind.to_ascii_uppercase().as_str() {
        "TEXT" => ColumnType::Text,
        "NUMBER" => ColumnType::Number,
        other => return Err(anyhow!("unknown column type '{other}'")),
    };
    Ok(ColumnDef::new(name, column_type, nullable))
}

fn parse_record(text: &str) -> Result<Record> {
    serde_json::from_str(text).context("record must be a JSON object")
}

fn read_rows(path: &Path) -> Result<Vec<Record>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).context("import file must be a JSON array of objects")
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn master_password() -> Result<Zeroizing<String>> {
    match std::env::var(ENV_MASTER_PASSWORD) {
        Ok(password) if !password.is_empty() => Ok(Zeroizing::new(password)),
        _ => prompt_password("Master password"),
    }
}

fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    let pw = rpassword::prompt_password(format!("{prompt}: ")).map_err(|e| anyhow!("password prompt: {e}"))?;
    Ok(Zeroizing::new(pw))
}

fn prompt_new_password(prompt: &str) -> Result<Zeroizing<String>> {
    let first = prompt_password(prompt)?;
    let second = prompt_password("Confirm password")?;
    if *first != *second {
        return Err(anyhow!("passwords do not match"));
    }
    Ok(first)
}

fn prompt_line(prompt: &str) -> Result<String> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
