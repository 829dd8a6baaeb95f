//! Configuration for the nackfec-sim application.
//!
//! Turns command-line flags into a session geometry plus channel settings.
//! Anything left unset is drawn from a ChaCha stream keyed by the run seed,
//! so a bare invocation still exercises a varied geometry and `--seed`
//! replays it exactly.

use nackfec_core::SessionConfig;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Complete configuration for a simulation run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Seed for the channel and every randomized default
    pub seed: u64,

    // === Session ===
    /// Pool, block and window sizing shared by sender and receiver
    pub session: SessionConfig,

    // === Transfer ===
    /// Blocks to deliver
    pub blocks: u32,

    /// Channel loss probability (0.0-1.0)
    pub loss_rate: f64,

    /// Give up after this many rounds
    pub max_rounds: u64,

    // === Behavior ===
    /// Whether to print detailed config
    pub print_config: bool,

    /// Whether to print detailed metrics summary
    pub print_metrics: bool,
}

/// Read the value following flag `args[*i]`.
fn flag_value<T: std::str::FromStr>(args: &[String], i: &mut usize, what: &str) -> Result<T, String> {
    let flag = &args[*i];
    *i += 1;
    let raw = args
        .get(*i)
        .ok_or_else(|| format!("{flag} requires {what}"))?;
    raw.parse()
        .map_err(|_| format!("invalid {}: {raw}", flag.trim_start_matches("--")))
}

impl Config {
    /// Parse configuration from command-line arguments.
    ///
    /// Unset fields are drawn from the seed; without `--seed` the clock picks one.
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        let mut seed: Option<u64> = None;
        let mut segment_size: Option<u16> = None;
        let mut segment_count: Option<usize> = None;
        let mut num_data: Option<u16> = None;
        let mut num_parity: Option<u16> = None;
        let mut auto_parity: Option<u16> = None;
        let mut block_pool: Option<usize> = None;
        let mut blocks: Option<u32> = None;
        let mut window: Option<u32> = None;
        let mut table_size: Option<u32> = None;
        let mut loss_rate: Option<f64> = None;
        let mut max_rounds: Option<u64> = None;
        let mut print_config = false;
        let mut print_metrics = true;

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--seed" => seed = Some(flag_value(args, &mut i, "a number")?),
                "--segment-size" => segment_size = Some(flag_value(args, &mut i, "a number")?),
                "--segment-count" => segment_count = Some(flag_value(args, &mut i, "a number")?),
                "--num-data" => num_data = Some(flag_value(args, &mut i, "a number")?),
                "--num-parity" => num_parity = Some(flag_value(args, &mut i, "a number")?),
                "--auto-parity" => auto_parity = Some(flag_value(args, &mut i, "a number")?),
                "--block-pool" => block_pool = Some(flag_value(args, &mut i, "a number")?),
                "--blocks" => blocks = Some(flag_value(args, &mut i, "a number")?),
                "--window" => window = Some(flag_value(args, &mut i, "a number")?),
                "--table-size" => table_size = Some(flag_value(args, &mut i, "a number")?),
                "--loss" => loss_rate = Some(flag_value(args, &mut i, "a rate")?),
                "--no-loss" => {
                    loss_rate = Some(0.0);
                }
                "--max-rounds" => max_rounds = Some(flag_value(args, &mut i, "a number")?),
                "--print-config" => {
                    print_config = true;
                }
                "--no-metrics" => {
                    print_metrics = false;
                }
                "--help" | "-h" => {
                    print_help();
                    std::process::exit(0);
                }
                _ => {
                    return Err(format!("unknown argument: {}", args[i]));
                }
            }
            i += 1;
        }

        // Clock seed unless pinned
        let seed = seed.unwrap_or_else(|| {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0)
        });

        // Fill the gaps from the seeded stream
        let mut rng = ChaCha8Rng::seed_from_u64(seed);

        let num_data = num_data.unwrap_or(8);
        let num_parity = num_parity.unwrap_or_else(|| rng.gen_range(1..=4));
        let window = window.unwrap_or(16);
        let block_pool = block_pool.unwrap_or(window as usize);
        let block_size = num_data as usize + num_parity as usize;

        let config = Config {
            seed,
            session: SessionConfig {
                segment_size: segment_size.unwrap_or(1024),
                segment_count: segment_count.unwrap_or(block_pool * block_size),
                num_data,
                num_parity,
                auto_parity: auto_parity.unwrap_or(0),
                block_count: block_pool,
                window,
                table_size: table_size.unwrap_or(window),
            },
            blocks: blocks.unwrap_or_else(|| rng.gen_range(32..=256)),
            loss_rate: loss_rate.unwrap_or_else(|| {
                // Mostly light loss
                let r: f64 = rng.gen();
                (r * r * 0.2).min(0.2) // 0-20%, biased toward 0
            }),
            max_rounds: max_rounds.unwrap_or(10_000),
            print_config,
            print_metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the simulation cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        self.session.validate().map_err(|e| e.to_string())?;
        if !(0.0..1.0).contains(&self.loss_rate) {
            return Err(format!("loss rate must be in [0, 1): {}", self.loss_rate));
        }
        if self.blocks == 0 {
            return Err("blocks must be non-zero".to_string());
        }
        if self.max_rounds == 0 {
            return Err("max-rounds must be non-zero".to_string());
        }
        Ok(())
    }

    /// Print the configuration in human-readable form.
    pub fn print(&self) {
        let session = &self.session;
        println!("=== Configuration ===");
        println!("Seed: {}", self.seed);
        println!("Blocks: {}", self.blocks);
        println!("Loss rate: {:.2}%", self.loss_rate * 100.0);
        println!("Max rounds: {}", self.max_rounds);
        println!();
        println!("=== Session ===");
        println!("Segment size: {} bytes", session.segment_size);
        println!("Segment pool: {} segments", session.segment_count);
        println!(
            "Block geometry: {} data + {} parity ({} auto)",
            session.num_data, session.num_parity, session.auto_parity
        );
        println!("Block pool: {} blocks", session.block_count);
        println!("Window: {} blocks", session.window);
        println!("Table size: {}", session.table_size);
        println!();
    }
}

fn print_help() {
    println!("nackfec-sim: Loopback NACK/FEC repair simulation");
    println!();
    println!("USAGE:");
    println!("    nackfec-sim [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    --seed <N>              Random seed for determinism");
    println!();
    println!("    --segment-size <N>      Segment payload bytes (default: 1024)");
    println!("    --segment-count <N>     Segment pool size (default: block pool * block size)");
    println!("    --num-data <N>          Data segments per block (default: 8)");
    println!("    --num-parity <N>        Parity segments per block (default: random 1-4)");
    println!("    --auto-parity <N>       Parity sent with every block (default: 0)");
    println!("    --block-pool <N>        Block pool size (default: window)");
    println!("    --window <N>            Block buffer window (default: 16)");
    println!("    --table-size <N>        Block buffer hash slots (default: window)");
    println!();
    println!("    --blocks <N>            Blocks to deliver (default: random 32-256)");
    println!("    --loss <RATE>           Segment loss rate 0.0-1.0 (default: random 0-0.2)");
    println!("    --no-loss               Disable loss (same as --loss 0)");
    println!("    --max-rounds <N>        Give up after N rounds (default: 10000)");
    println!();
    println!("    --print-config          Print resolved configuration");
    println!("    --no-metrics            Don't print metrics summary");
    println!("    --help, -h              Print this help");
    println!();
    println!("EXAMPLES:");
    println!("    nackfec-sim                                 # Run with random defaults");
    println!("    nackfec-sim --seed 42                       # Deterministic run");
    println!("    nackfec-sim --loss 0.3 --num-parity 4       # Heavy loss, more parity");
    println!("    nackfec-sim --segment-count 40 --window 4   # Starved pools, backpressure");
    println!();
}
