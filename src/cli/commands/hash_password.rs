//! Hash-password command implementation.

use crate::access::hash_credential;
use anyhow::{Context, Result};
use argon2::Params;
use clap::Args;
use std::io::BufRead;

/// Print an Argon2id hash for an `[[identities]]` entry.
#[derive(Args, Debug)]
pub struct HashPasswordArgs {
    /// Password to hash; read from stdin when omitted.
    pub password: Option<String>,

    /// Memory cost in KiB.
    #[arg(long, default_value_t = Params::DEFAULT_M_COST)]
    pub memory_kib: u32,

    /// Number of passes.
    #[arg(long, default_value_t = Params::DEFAULT_T_COST)]
    pub iterations: u32,
}

/// Run the hash-password command.
pub fn run_hash_password(args: HashPasswordArgs) -> Result<()> {
    let password = match args.password {
        Some(password) => password,
        None => {
            let mut line = String::new();
            std::io::stdin()
                .lock()
                .read_line(&mut line)
                .context("failed to read password from stdin")?;
            line.trim_end_matches(['\r', '\n']).to_string()
        }
    };
    if password.is_empty() {
        anyhow::bail!("password must not be empty");
    }
    println!(
        "{}",
        hash_password(&password, args.memory_kib, args.iterations)?
    );
    Ok(())
}

/// Hash `password` with the given Argon2 costs.
pub fn hash_password(password: &str, memory_kib: u32, iterations: u32) -> Result<String> {
    hash_credential(password, memory_kib, iterations).context("failed to hash password")
}
