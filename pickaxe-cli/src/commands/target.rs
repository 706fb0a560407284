use anyhow::{Context, Result};
use clap::Args;
use pickaxe_hash::Target;

/// Expand compact bits or a share difficulty into a full target
#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Compact bits as hex, e.g. 1d00ffff
    #[arg(required_unless_present = "difficulty", conflicts_with = "difficulty")]
    pub bits: Option<String>,

    /// Pool share difficulty instead of compact bits
    #[arg(short, long)]
    pub difficulty: Option<f64>,
}

pub async fn execute(args: TargetArgs) -> Result<()> {
    let target = match (&args.bits, args.difficulty) {
        (Some(bits), _) => Target::from_compact(parse_bits(bits)?),
        (None, Some(difficulty)) => Target::from_difficulty(difficulty),
        (None, None) => anyhow::bail!("Either bits or --difficulty is required"),
    };
    println!("{}", target.to_hex());
    Ok(())
}

/// Parse compact bits written as hex, with or without `0x`
pub fn parse_bits(input: &str) -> Result<u32> {
    let digits = input.trim().trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).with_context(|| format!("Invalid compact bits: {}", input))
}
