//----------------------------------------------------------------------------------------------
// Module protection
// Seed and key resource unlock, key computation is delegated to a KeyProvider

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::process::Command as ProcessCommand;
use std::sync::Arc;

use crate::channel::CommandSender;
use crate::codec::{Command, FieldReader};
use crate::error::{KeyError, TransactionError, XcpError};
use crate::protocol::*;

//----------------------------------------------------------------------------------------------
// Key provider

/// Computes the key for a seed
/// Treated as a pure function of resource and seed
pub trait KeyProvider: Send + Sync {
    fn compute_key(&self, resource: Resource, seed: &[u8]) -> Result<Vec<u8>, KeyError>;
}

impl<F> KeyProvider for F
where
    F: Fn(Resource, &[u8]) -> Result<Vec<u8>, KeyError> + Send + Sync,
{
    fn compute_key(&self, resource: Resource, seed: &[u8]) -> Result<Vec<u8>, KeyError> {
        self(resource, seed)
    }
}

/// Key is the seed xor a repeated mask
#[derive(Debug, Clone)]
pub struct XorKeyProvider {
    mask: Vec<u8>,
}

impl XorKeyProvider {
    pub fn new(mask: &[u8]) -> XorKeyProvider {
        XorKeyProvider { mask: mask.to_vec() }
    }
}

impl KeyProvider for XorKeyProvider {
    fn compute_key(&self, _resource: Resource, seed: &[u8]) -> Result<Vec<u8>, KeyError> {
        if self.mask.is_empty() {
            return Err(KeyError::Provider("empty xor mask".to_string()));
        }
        Ok(seed.iter().zip(self.mask.iter().cycle()).map(|(s, m)| s ^ m).collect())
    }
}

/// External key generator program
/// Called as `program [args..] <resource> <seed hex>`, prints the key as hex on stdout
#[derive(Debug, Clone)]
pub struct CommandKeyProvider {
    program: String,
    args: Vec<String>,
}

impl CommandKeyProvider {
    pub fn new<S: Into<String>>(program: S, args: &[&str]) -> CommandKeyProvider {
        CommandKeyProvider {
            program: program.into(),
            args: args.iter().map(|s| (*s).to_string()).collect(),
        }
    }
}

impl KeyProvider for CommandKeyProvider {
    fn compute_key(&self, resource: Resource, seed: &[u8]) -> Result<Vec<u8>, KeyError> {
        let output = ProcessCommand::new(&self.program)
            .args(&self.args)
            .arg(format!("{}", resource.bits()))
            .arg(encode_hex(seed))
            .output()?;
        if !output.status.success() {
            return Err(KeyError::Provider(format!("{} exited with {}", self.program, output.status)));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        decode_hex(stdout.trim()).ok_or_else(|| KeyError::Provider(format!("{} returned invalid key '{}'", self.program, stdout.trim())))
    }
}

fn encode_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02X}", b)).collect()
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len()).step_by(2).map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok()).collect()
}

//----------------------------------------------------------------------------------------------
// Seed and key exchange

/// Get the seed for one resource, possibly in several parts
/// An empty seed means the resource is not protected
async fn get_seed<C: CommandSender + ?Sized>(sender: &C, resource: Resource) -> Result<Vec<u8>, XcpError> {
    let data = sender.command(&Command::GetSeed { mode: SEED_MODE_FIRST, resource }).await?;
    let first = SeedResponse::parse(&data)?;
    let length = first.remaining as usize;
    let mut seed = first.part;
    seed.truncate(length);
    while seed.len() < length {
        let data = sender.command(&Command::GetSeed { mode: SEED_MODE_REMAINING, resource }).await?;
        let part = SeedResponse::parse(&data)?;
        let missing = length - seed.len();
        if part.part.is_empty() || part.remaining as usize != missing {
            return Err(XcpError::Protocol(format!("GET_SEED: expected {} remaining seed bytes, got {}", missing, part.remaining)));
        }
        seed.extend(part.part.iter().take(missing));
    }
    Ok(seed)
}

/// Send the key, split into parts which fit into one command packet
/// Returns the protection status from the last UNLOCK response
async fn send_key<C: CommandSender + ?Sized>(sender: &C, key: &[u8]) -> Result<Resource, XcpError> {
    let max_part = (sender.codec().max_cto as usize).saturating_sub(2).max(1);
    if key.is_empty() || key.len() > 0xFF {
        return Err(XcpError::Protocol(format!("invalid key length {}", key.len())));
    }
    let mut remaining = key.len();
    let mut protection = Resource::empty();
    for part in key.chunks(max_part) {
        let data = sender
            .command(&Command::Unlock {
                remaining: remaining as u8,
                key: part.to_vec(),
            })
            .await?;
        remaining -= part.len();
        let mut r = FieldReader::response(&data, sender.codec().endianness)?;
        protection = Resource::from_bits_truncate(r.u8()?);
    }
    Ok(protection)
}

// Key providers may block, e.g. on an external program
async fn compute_key(keys: &Arc<dyn KeyProvider>, resource: Resource, seed: Vec<u8>) -> Result<Vec<u8>, KeyError> {
    let keys = Arc::clone(keys);
    tokio::task::spawn_blocking(move || keys.compute_key(resource, &seed))
        .await
        .map_err(|e| KeyError::Provider(format!("key provider failed: {}", e)))?
}

/// Unlock one resource, returns the remaining protection status
/// `protection` is the status known before, kept apart from `resource` if the target reports no seed
pub(crate) async fn unlock_resource<C: CommandSender + ?Sized>(sender: &C, keys: &Arc<dyn KeyProvider>, resource: Resource, protection: Resource) -> Result<Resource, XcpError> {
    let seed = get_seed(sender, resource).await?;
    if seed.is_empty() {
        debug!("unlock: {:?} is not protected", resource);
        return Ok(protection - resource);
    }
    debug!("unlock: {:?} seed = {:02X?}", resource, seed);

    let key = compute_key(keys, resource, seed).await?;
    trace!("unlock: {:?} key = {:02X?}", resource, key);

    match send_key(sender, &key).await {
        Ok(protection) => {
            if protection.intersects(resource) {
                warn!("unlock: key accepted but {:?} still protected", resource);
                return Err(XcpError::UnlockDenied(resource));
            }
            info!("unlock: {:?} unlocked", resource);
            Ok(protection)
        }
        Err(XcpError::Transaction(TransactionError::Rejected(code))) if code.0 == CRC_ACCESS_LOCKED || code.0 == CRC_ACCESS_DENIED => {
            warn!("unlock: key for {:?} rejected, {}", resource, code);
            Err(XcpError::UnlockDenied(resource))
        }
        Err(e) => Err(e),
    }
}

//----------------------------------------------------------------------------------------------
