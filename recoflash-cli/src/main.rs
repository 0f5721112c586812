//! recoflash CLI - recover a bricked device over its serial recovery
//! bootloader.
//!
//! ## Features
//!
//! - Program and verify Intel HEX firmware images
//! - Page, flash, UICR and mass erase
//! - UICR register read/write and application read protection
//! - Device info and firmware version queries
//! - Shell completion generation

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use recoflash::{
    list_ports, FirmwareImage, NativePort, SerialConfig, Session, SessionConfig,
    UICR_BASE_ADDRESS,
};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// recoflash - recover a bricked device over its serial recovery bootloader.
///
/// Environment variables:
///   RECOFLASH_PORT   - Default serial port
///   RECOFLASH_BAUD   - Default baud rate (default: 115200)
#[derive(Parser)]
#[command(name = "recoflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port connected to the device (e.g. /dev/ttyUSB0, COM3).
    #[arg(short, long, global = true, env = "RECOFLASH_PORT")]
    port: Option<String>,

    /// Baud rate.
    #[arg(
        short,
        long,
        global = true,
        default_value = "115200",
        env = "RECOFLASH_BAUD"
    )]
    baud: u32,

    /// Response timeout in seconds.
    #[arg(short, long, global = true, default_value = "1")]
    timeout: u64,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Erase strategy applied before programming.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum EraseMode {
    /// Erase only the pages being programmed (default).
    Sector,
    /// Erase all application flash first, leaving UICR intact.
    Flash,
    /// Erase all application flash and UICR first.
    All,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Program an Intel HEX firmware image.
    Flash {
        /// Path to the firmware image.
        image: PathBuf,

        /// Erase strategy applied before programming.
        #[arg(long, value_enum, default_value_t = EraseMode::Sector)]
        erase_mode: EraseMode,

        /// Verify device contents against the image after programming.
        #[arg(long)]
        verify: bool,

        /// Reset the device after programming.
        #[arg(long)]
        reset: bool,
    },

    /// Verify that device contents match an Intel HEX image.
    Verify {
        /// Path to the firmware image.
        image: PathBuf,
    },

    /// Erase flash, UICR or a single page.
    Erase {
        /// Erase all application flash and UICR in one transaction.
        #[arg(long)]
        all: bool,

        /// Erase the UICR page only.
        #[arg(long)]
        uicr: bool,

        /// Erase all application flash page by page, leaving UICR intact.
        #[arg(long)]
        flash: bool,

        /// Erase the page at this address (hex).
        #[arg(long, value_parser = parse_hex_u32)]
        page: Option<u32>,
    },

    /// Read the UICR region.
    ReadUicr {
        /// Write the raw bytes to this file instead of dumping to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write one 32-bit value to a UICR register.
    WriteUicr {
        /// Register address (hex).
        #[arg(value_parser = parse_hex_u32)]
        address: u32,

        /// Value to write (hex).
        #[arg(value_parser = parse_hex_u32)]
        value: u32,
    },

    /// Enable application read protection.
    Protect,

    /// Reset the device.
    Reset,

    /// Show device identity, flash geometry and versions.
    Info {
        /// Output as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Print the bootloader firmware version.
    FwVersion,

    /// List available serial ports.
    ListPorts {
        /// Output the port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Parse a hexadecimal address (0x prefix and underscores allowed).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(None)
        .init();

    debug!(
        "recoflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match &cli.command {
        Commands::Flash {
            image,
            erase_mode,
            verify,
            reset,
        } => cmd_flash(&cli, image, *erase_mode, *verify, *reset),
        Commands::Verify { image } => cmd_verify(&cli, image),
        Commands::Erase {
            all,
            uicr,
            flash,
            page,
        } => cmd_erase(&cli, *all, *uicr, *flash, *page),
        Commands::ReadUicr { output } => cmd_read_uicr(&cli, output.as_deref()),
        Commands::WriteUicr { address, value } => cmd_write_uicr(&cli, *address, *value),
        Commands::Protect => cmd_protect(&cli),
        Commands::Reset => cmd_reset(&cli),
        Commands::Info { json } => cmd_info(&cli, *json),
        Commands::FwVersion => cmd_fw_version(&cli),
        Commands::ListPorts { json } => {
            cmd_list_ports(*json);
            Ok(())
        }
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            Ok(())
        }
    }
}

/// Open the serial port and bootstrap a session.
fn open_session(cli: &Cli) -> Result<Session<NativePort>> {
    let port_name = cli
        .port
        .clone()
        .context("no serial port given (use --port or RECOFLASH_PORT)")?;

    if !cli.quiet {
        eprintln!(
            "{} connecting to {} at {} baud",
            style("→").cyan(),
            style(&port_name).bold(),
            cli.baud
        );
    }

    let serial = SerialConfig::new(&port_name, cli.baud)
        .with_timeout(Duration::from_secs(cli.timeout));
    let port = NativePort::open(&serial)
        .with_context(|| format!("failed to open serial port {port_name}"))?;

    let config = SessionConfig::default().with_read_timeout(Duration::from_secs(cli.timeout));
    let session = Session::open(port, config).context("device did not enter a session")?;

    if !cli.quiet {
        eprintln!(
            "{} connected, bootloader {}",
            style("✓").green(),
            session.firmware_version()
        );
    }
    Ok(session)
}

/// Load a firmware image and show what it contains.
fn load_image(cli: &Cli, path: &PathBuf) -> Result<FirmwareImage> {
    if !cli.quiet {
        eprintln!(
            "{} loading firmware image {}",
            style("📦").cyan(),
            path.display()
        );
    }

    let image = FirmwareImage::from_file(path)
        .with_context(|| format!("failed to load firmware image {}", path.display()))?;

    if image.is_empty() {
        bail!("firmware image {} contains no data", path.display());
    }

    if !cli.quiet {
        for segment in image.segments() {
            let region = if segment.address > UICR_BASE_ADDRESS {
                "UICR"
            } else {
                "flash"
            };
            eprintln!(
                "    {} 0x{:08X}..0x{:08X} ({} bytes, {})",
                style("•").dim(),
                segment.address,
                segment.end_address(),
                segment.data.len(),
                region
            );
        }
    }
    Ok(image)
}

/// Build the byte-progress bar used while programming.
fn progress_bar(cli: &Cli, total: u64, message: &str) -> ProgressBar {
    if cli.quiet {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.set_message(message.to_string());
    pb
}

/// Flash command implementation.
fn cmd_flash(
    cli: &Cli,
    image_path: &PathBuf,
    erase_mode: EraseMode,
    verify: bool,
    reset: bool,
) -> Result<()> {
    let image = load_image(cli, image_path)?;
    let mut session = open_session(cli)?;

    match erase_mode {
        EraseMode::Sector => {}
        EraseMode::Flash => {
            if !cli.quiet {
                eprintln!("{} erasing application flash", style("🗑").red());
            }
            session.chip_flash_erase()?;
        }
        EraseMode::All => {
            if !cli.quiet {
                eprintln!("{} erasing all flash and UICR", style("🗑").red());
            }
            session.erase_all()?;
        }
    }

    let pb = progress_bar(cli, image.total_bytes() as u64, "programming");
    session.flash_image_with_progress(&image, |done, _total| {
        pb.set_position(done as u64);
    })?;
    pb.finish_with_message("done");

    if verify {
        session.verify_image(&image)?;
        if !cli.quiet {
            eprintln!("{} verification passed", style("✓").green());
        }
    }

    if reset {
        session.reset()?;
        if !cli.quiet {
            eprintln!("{} device reset", style("🔄").cyan());
        }
    }

    if !cli.quiet {
        eprintln!("\n{} flashing complete", style("🎉").green().bold());
    }
    Ok(())
}

/// Verify command implementation.
fn cmd_verify(cli: &Cli, image_path: &PathBuf) -> Result<()> {
    let image = load_image(cli, image_path)?;
    let mut session = open_session(cli)?;

    session.verify_image(&image)?;

    if !cli.quiet {
        eprintln!(
            "{} device contents match {}",
            style("✓").green().bold(),
            image_path.display()
        );
    }
    Ok(())
}

/// Erase command implementation.
fn cmd_erase(cli: &Cli, all: bool, uicr: bool, flash: bool, page: Option<u32>) -> Result<()> {
    let selected = usize::from(all) + usize::from(uicr) + usize::from(flash) + usize::from(page.is_some());
    if selected != 1 {
        bail!("specify one of --all, --uicr, --flash or --page <ADDR>");
    }

    let mut session = open_session(cli)?;

    if all {
        session.erase_all()?;
    } else if uicr {
        session.erase_uicr()?;
    } else if flash {
        let pb = if cli.quiet {
            ProgressBar::hidden()
        } else {
            let pb = ProgressBar::new(0);
            #[allow(clippy::unwrap_used)] // Static template string
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} pages")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
            pb
        };
        session.chip_flash_erase_with_progress(|done, total| {
            pb.set_length(total as u64);
            pb.set_position(done as u64);
        })?;
        pb.finish();
    } else if let Some(address) = page {
        session.erase_page(address)?;
    }

    if !cli.quiet {
        eprintln!("{} erase complete", style("✓").green().bold());
    }
    Ok(())
}

/// Read-uicr command implementation.
fn cmd_read_uicr(cli: &Cli, output: Option<&std::path::Path>) -> Result<()> {
    let mut session = open_session(cli)?;

    let uicr_size = session.descriptor().uicr_size;
    let data = session.read_uicr(UICR_BASE_ADDRESS, uicr_size)?;

    match output {
        Some(path) => {
            fs::write(path, &data)
                .with_context(|| format!("failed to write {}", path.display()))?;
            if !cli.quiet {
                eprintln!(
                    "{} UICR ({} bytes) saved to {}",
                    style("✓").green(),
                    data.len(),
                    path.display()
                );
            }
        }
        None => {
            for (index, chunk) in data.chunks(16).enumerate() {
                let address = UICR_BASE_ADDRESS + (index * 16) as u32;
                let bytes: Vec<String> = chunk.iter().map(|b| format!("{b:02X}")).collect();
                println!("{address:08X}: {}", bytes.join(" "));
            }
        }
    }
    Ok(())
}

/// Write-uicr command implementation.
fn cmd_write_uicr(cli: &Cli, address: u32, value: u32) -> Result<()> {
    let mut session = open_session(cli)?;
    session.flash_uicr(address, &value.to_le_bytes())?;

    if !cli.quiet {
        eprintln!(
            "{} wrote 0x{value:08X} to 0x{address:08X}",
            style("✓").green().bold()
        );
    }
    Ok(())
}

/// Protect command implementation.
fn cmd_protect(cli: &Cli) -> Result<()> {
    let mut session = open_session(cli)?;
    session.protect_application()?;

    if !cli.quiet {
        eprintln!(
            "{} application read protection enabled",
            style("✓").green().bold()
        );
    }
    Ok(())
}

/// Reset command implementation.
fn cmd_reset(cli: &Cli) -> Result<()> {
    let mut session = open_session(cli)?;
    session.reset()?;

    if !cli.quiet {
        eprintln!("{} device reset", style("✓").green().bold());
    }
    Ok(())
}

/// Info command implementation.
fn cmd_info(cli: &Cli, json: bool) -> Result<()> {
    let session = open_session(cli)?;
    let descriptor = session.descriptor();

    if json {
        let info = serde_json::json!({
            "part": format!("0x{:08X}", descriptor.part),
            "variant": format!("0x{:08X}", descriptor.variant),
            "flash_size": descriptor.flash_size,
            "page_size": descriptor.page_size,
            "uicr_size": descriptor.uicr_size,
            "protocol_version": descriptor.protocol_version,
            "firmware_version": descriptor.firmware_version,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&info).unwrap_or_default()
        );
        return Ok(());
    }

    eprintln!("{}", style("Device information").bold().underlined());
    eprintln!("  Part:             0x{:08X}", descriptor.part);
    eprintln!("  Variant:          0x{:08X}", descriptor.variant);
    eprintln!(
        "  Flash:            {} KiB ({} byte pages)",
        descriptor.flash_size / 1024,
        descriptor.page_size
    );
    eprintln!("  UICR:             {} bytes", descriptor.uicr_size);
    eprintln!("  Protocol version: {}", descriptor.protocol_version);
    eprintln!("  Firmware version: {}", descriptor.firmware_version);
    Ok(())
}

/// Fw-version command implementation.
fn cmd_fw_version(cli: &Cli) -> Result<()> {
    let session = open_session(cli)?;
    println!("{}", session.firmware_version());
    Ok(())
}

/// List ports command implementation.
fn cmd_list_ports(json: bool) {
    let ports = match list_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!("could not enumerate serial ports: {e}");
            Vec::new()
        }
    };

    if json {
        let ports: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial_number,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).unwrap_or_default()
        );
        return;
    }

    eprintln!("{}", style("Available serial ports").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("none found").dim());
        return;
    }
    for port in &ports {
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port.product.as_deref().unwrap_or("");
        eprintln!(
            "  {} {}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            vid_pid,
            if product.is_empty() {
                String::new()
            } else {
                format!(" - {}", style(product).dim())
            }
        );
    }
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    // ---- clap validation ----

    #[test]
    fn test_cli_command_is_valid() {
        // Verifies that all derive macros produce a valid clap Command
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_flash() {
        let cli = Cli::try_parse_from([
            "recoflash",
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "115200",
            "flash",
            "firmware.hex",
        ])
        .unwrap();
        assert_eq!(cli.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cli.baud, 115200);
        assert!(matches!(cli.command, Commands::Flash { .. }));
    }

    #[test]
    fn test_cli_parse_flash_with_all_options() {
        let cli = Cli::try_parse_from([
            "recoflash",
            "flash",
            "fw.hex",
            "--erase-mode",
            "flash",
            "--verify",
            "--reset",
        ])
        .unwrap();
        if let Commands::Flash {
            image,
            erase_mode,
            verify,
            reset,
        } = cli.command
        {
            assert_eq!(image.to_str().unwrap(), "fw.hex");
            assert_eq!(erase_mode, EraseMode::Flash);
            assert!(verify);
            assert!(reset);
        } else {
            panic!("Expected Flash command");
        }
    }

    #[test]
    fn test_cli_flash_default_erase_mode_is_sector() {
        let cli = Cli::try_parse_from(["recoflash", "flash", "fw.hex"]).unwrap();
        if let Commands::Flash { erase_mode, .. } = cli.command {
            assert_eq!(erase_mode, EraseMode::Sector);
        } else {
            panic!("Expected Flash command");
        }
    }

    #[test]
    fn test_cli_parse_verify() {
        let cli = Cli::try_parse_from(["recoflash", "verify", "fw.hex"]).unwrap();
        assert!(matches!(cli.command, Commands::Verify { .. }));
    }

    #[test]
    fn test_cli_parse_erase_page() {
        let cli = Cli::try_parse_from(["recoflash", "erase", "--page", "0x7000"]).unwrap();
        if let Commands::Erase { page, .. } = cli.command {
            assert_eq!(page, Some(0x7000));
        } else {
            panic!("Expected Erase command");
        }
    }

    #[test]
    fn test_cli_parse_write_uicr() {
        let cli =
            Cli::try_parse_from(["recoflash", "write-uicr", "0x10001208", "0x00FFFFFF"]).unwrap();
        if let Commands::WriteUicr { address, value } = cli.command {
            assert_eq!(address, 0x1000_1208);
            assert_eq!(value, 0x00FF_FFFF);
        } else {
            panic!("Expected WriteUicr command");
        }
    }

    #[test]
    fn test_cli_parse_read_uicr_output() {
        let cli = Cli::try_parse_from(["recoflash", "read-uicr", "-o", "uicr.bin"]).unwrap();
        if let Commands::ReadUicr { output } = cli.command {
            assert_eq!(output.unwrap().to_str().unwrap(), "uicr.bin");
        } else {
            panic!("Expected ReadUicr command");
        }
    }

    #[test]
    fn test_cli_parse_info_json() {
        let cli = Cli::try_parse_from(["recoflash", "info", "--json"]).unwrap();
        if let Commands::Info { json } = cli.command {
            assert!(json);
        } else {
            panic!("Expected Info command");
        }
    }

    #[test]
    fn test_cli_default_values() {
        let cli = Cli::try_parse_from(["recoflash", "list-ports"]).unwrap();
        assert_eq!(cli.baud, 115200);
        assert_eq!(cli.timeout, 1);
        assert!(!cli.quiet);
        assert!(cli.port.is_none());
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_cli_missing_subcommand() {
        assert!(Cli::try_parse_from(["recoflash"]).is_err());
    }

    #[test]
    fn test_cli_parse_completions() {
        let cli = Cli::try_parse_from(["recoflash", "completions", "bash"]).unwrap();
        assert!(matches!(cli.command, Commands::Completions { .. }));
    }

    // ---- parse_hex_u32 ----

    #[test]
    fn test_parse_hex_u32_with_prefix() {
        assert_eq!(parse_hex_u32("0x00001000").unwrap(), 0x1000);
        assert_eq!(parse_hex_u32("0X00001000").unwrap(), 0x1000);
    }

    #[test]
    fn test_parse_hex_u32_without_prefix() {
        assert_eq!(parse_hex_u32("DEADBEEF").unwrap(), 0xDEADBEEF);
        assert_eq!(parse_hex_u32("ff").unwrap(), 0xFF);
    }

    #[test]
    fn test_parse_hex_u32_with_underscores() {
        assert_eq!(parse_hex_u32("0x1000_1208").unwrap(), 0x1000_1208);
    }

    #[test]
    fn test_parse_hex_u32_with_whitespace() {
        assert_eq!(parse_hex_u32("  0xFF  ").unwrap(), 0xFF);
    }

    #[test]
    fn test_parse_hex_u32_invalid() {
        assert!(parse_hex_u32("not_hex").is_err());
        assert!(parse_hex_u32("0xGG").is_err());
    }

    #[test]
    fn test_parse_hex_u32_overflow() {
        assert!(parse_hex_u32("0x1FFFFFFFF").is_err());
    }
}
