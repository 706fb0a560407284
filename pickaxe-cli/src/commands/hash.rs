use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use pickaxe_hash::{double_sha256, meets_target, Target, HEADER_SIZE};

use super::target::parse_bits;

/// Double-hash an 80-byte block header
#[derive(Args, Debug)]
pub struct HashArgs {
    /// Serialized header as hex
    pub header: String,

    /// Also check the digest against these compact bits
    #[arg(long)]
    pub bits: Option<String>,
}

pub async fn execute(args: HashArgs) -> Result<()> {
    let header = parse_header(&args.header)?;
    let digest = double_sha256(&header);
    println!("{}", digest.to_hex());

    if let Some(bits) = &args.bits {
        let target = Target::from_compact(parse_bits(bits)?);
        if meets_target(&digest, &target) {
            println!("{}", "✓ meets target".green());
        } else {
            println!("{}", "✗ above target".red());
        }
    }
    Ok(())
}

fn parse_header(input: &str) -> Result<[u8; HEADER_SIZE]> {
    let bytes = hex::decode(input.trim()).context("Header is not valid hex")?;
    bytes.as_slice().try_into().map_err(|_| {
        anyhow::anyhow!("Header must be {} bytes, got {}", HEADER_SIZE, bytes.len())
    })
}
