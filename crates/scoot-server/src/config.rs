use crate::facade::ServiceSettings;
use crate::ledger::Pricing;
use anyhow::bail;
use clap::Parser;
use std::path::PathBuf;

/// Runtime configuration for the `scoot-server` binary.
///
/// Every value can be given as a CLI flag or an environment variable (a
/// `.env` file is loaded first). The defaults describe a 20 x 20 city with a
/// search radius of 2.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "scoot-server",
    version,
    about = "A TCP service for reserving shared scooters on a grid"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Example: "0.0.0.0:20023" or "127.0.0.1:0" for an ephemeral port.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:20023"))]
    pub server_addr: String,

    /// Side length of the square city grid.
    ///
    /// Must be a positive multiple of `2 * RADIUS` so the grid tiles into
    /// whole locking chunks.
    ///
    /// Environment variable: `GRID_SIZE`
    #[arg(long, env = "GRID_SIZE", default_value_t = 20)]
    pub grid_size: i32,

    /// Manhattan radius used for vehicle and reward queries.
    ///
    /// Environment variable: `RADIUS`
    #[arg(long, env = "RADIUS", default_value_t = 2)]
    pub radius: i32,

    /// Number of scooters scattered over the grid at startup.
    ///
    /// Environment variable: `SCOOTERS`
    #[arg(long, env = "SCOOTERS", default_value_t = 50)]
    pub scooters: usize,

    /// Fare charged per whole second of a trip.
    ///
    /// Environment variable: `PRICE_PER_SECOND`
    #[arg(long, env = "PRICE_PER_SECOND", default_value_t = 20)]
    pub price_per_second: i32,

    /// Fare charged per unit of Manhattan distance travelled.
    ///
    /// Environment variable: `PRICE_PER_UNIT`
    #[arg(long, env = "PRICE_PER_UNIT", default_value_t = 10)]
    pub price_per_unit: i32,

    /// Smallest prize a reward can carry.
    ///
    /// Environment variable: `MIN_PRIZE`
    #[arg(long, env = "MIN_PRIZE", default_value_t = 5)]
    pub min_prize: i32,

    /// Largest prize a reward can carry.
    ///
    /// Environment variable: `MAX_PRIZE`
    #[arg(long, env = "MAX_PRIZE", default_value_t = 20)]
    pub max_prize: i32,

    /// Optional file of `username:password` lines registered at startup.
    ///
    /// Environment variable: `USERS_FILE`
    #[arg(long, env = "USERS_FILE")]
    pub users_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub server_addr: String,
    pub grid_size: i32,
    pub radius: i32,
    pub scooters: usize,
    pub pricing: Pricing,
    pub min_prize: i32,
    pub max_prize: i32,
    pub users_file: Option<PathBuf>,
}

impl ServerConfig {
    pub fn service_settings(&self) -> ServiceSettings {
        ServiceSettings {
            grid_size: self.grid_size,
            radius: self.radius,
            pricing: self.pricing,
            prizes: self.min_prize..=self.max_prize,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.grid_size <= 0 {
            bail!("GRID_SIZE must be greater than 0");
        }

        if args.radius <= 0 {
            bail!("RADIUS must be greater than 0");
        }

        let chunk = args
            .radius
            .checked_mul(2)
            .ok_or_else(|| anyhow::anyhow!("Overflow in chunk size computation"))?;
        if args.grid_size % chunk != 0 {
            bail!(
                "GRID_SIZE ({}) must be a multiple of 2 * RADIUS ({})",
                args.grid_size,
                chunk
            );
        }

        if args.min_prize > args.max_prize {
            bail!(
                "MIN_PRIZE ({}) exceeds MAX_PRIZE ({})",
                args.min_prize,
                args.max_prize
            );
        }

        Ok(Self {
            server_addr: args.server_addr,
            grid_size: args.grid_size,
            radius: args.radius,
            scooters: args.scooters,
            pricing: Pricing {
                per_second: args.price_per_second,
                per_unit: args.price_per_unit,
            },
            min_prize: args.min_prize,
            max_prize: args.max_prize,
            users_file: args.users_file,
        })
    }
}
