//! Wallet credentials and log identity

use eyre::{eyre, Result, WrapErr};
use std::fmt;
use std::path::Path;

/// One set of wallet credentials
#[derive(Clone)]
pub struct Wallet {
    pub name: String,
    pub private_key: String,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wallet")
            .field("name", &self.name)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl Wallet {
    pub fn new(name: impl Into<String>, private_key: impl Into<String>) -> Result<Self> {
        let wallet = Self {
            name: name.into(),
            private_key: private_key.into(),
        };
        wallet.validate()?;
        Ok(wallet)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(eyre!("wallet name cannot be empty"));
        }
        if self.private_key.len() != 66 || !self.private_key.starts_with("0x") {
            return Err(eyre!(
                "private key for wallet {} must be 66 chars (0x + 64 hex chars)",
                self.name
            ));
        }
        Ok(())
    }
}

/// Identity of a wallet inside a batch, attached to every log line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletContext {
    pub name: String,
    pub index: usize,
    pub total: usize,
}

impl WalletContext {
    pub fn new(name: impl Into<String>, index: usize, total: usize) -> Self {
        Self {
            name: name.into(),
            index,
            total,
        }
    }
}

impl fmt::Display for WalletContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}/{}] [{}]", self.index, self.total, self.name)
    }
}

/// Parse wallet lines. Each non-empty, non-comment line is either
/// `name:0xkey` or a bare `0xkey` (named by its position).
pub fn parse_wallets(raw: &str) -> Result<Vec<Wallet>> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .enumerate()
        .map(|(i, line)| match line.split_once(':') {
            Some((name, key)) => Wallet::new(name.trim(), key.trim()),
            None => Wallet::new((i + 1).to_string(), line),
        })
        .collect()
}

/// Load wallets from a file
pub fn load_from_file(path: &Path) -> Result<Vec<Wallet>> {
    let raw = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("Failed to read wallets file {}", path.display()))?;
    let wallets = parse_wallets(&raw)?;
    if wallets.is_empty() {
        return Err(eyre!("No wallets found in {}", path.display()));
    }
    Ok(wallets)
}

/// Load wallets from `WALLET_KEYS` (comma separated entries) when set,
/// otherwise from `path`
pub fn load(path: &Path) -> Result<Vec<Wallet>> {
    match std::env::var("WALLET_KEYS") {
        Ok(raw) if !raw.trim().is_empty() => {
            let wallets = parse_wallets(&raw.replace(',', "\n"))?;
            if wallets.is_empty() {
                return Err(eyre!("WALLET_KEYS holds no wallets"));
            }
            Ok(wallets)
        }
        _ => load_from_file(path),
    }
}
