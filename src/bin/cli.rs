//! Flashcom command line interface.

use std::process;
use std::time::Duration;

use clap::{
    crate_authors, crate_description, crate_name, crate_version, value_t, App, AppSettings::*, Arg,
    ArgMatches,
};
use console::{style, Term};
use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, trace, LevelFilter};
use serialport::{DataBits, FlowControl, Parity, StopBits};
use simplelog::*;

use flashcom::{
    self as fc, BootloaderCapability, Command, Confirmation, Manifest, Observer, Orchestrator,
    Phase, ProgressKind, ProvisionError, Resolution, Selection, SelectionKey, SerialAuthority,
    TransferProgress,
};

fn main() {
    println!("[FC] flashcom v{}", crate_version!());

    ctrlc::set_handler(move || {
        println!("🛑 received Ctrl+C!");
        process::exit(0);
    })
    .expect("Failed to install my Ctrl-C handler!");

    let matches = App::new(crate_name!())
        .version(format!("v{}", crate_version!()).as_str())
        .author(crate_authors!())
        .about(crate_description!())
        .long_about(
            "\n\
            Flashcom looks up the firmware published for a software variant, \
            a hardware revision and a display module in a manifest, downloads \
            it, verifies its SHA-256 digest and writes it to the device over \
            the serial port.\n\
            \n\
            The manifest maps `Variant|revision|module` keys to firmware \
            descriptors. When the selection is not given on the command line, \
            the published selections are offered for interactive selection.\n\
            \n\
            Right after the port is opened, the device is reset into its \
            bootloader using the DTR/RTS control lines (disable with \
            --no-reset). The image is then pushed in fixed size slices; \
            nothing is read back from the device, whose output is only \
            logged.\
        ",
        )
        .max_term_width(80)
        .setting(ColoredHelp)
        .setting(NextLineHelp)
        .arg(
            Arg::with_name("MANIFEST")
                .help("URL or path of the firmware manifest")
                .short("-m")
                .long("--manifest")
                .takes_value(true)
                .required(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("VARIANT")
                .help("software variant (e.g. `chatbot`)")
                .long("--variant")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("REVISION")
                .help("hardware revision (e.g. `ESP32-S3-M16R8`)")
                .long("--revision")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("MODULE")
                .help("display module (e.g. `OLED-1.3`)")
                .long("--module")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("LIST")
                .help("list the published selections and exit")
                .long("--list"),
        )
        .arg(
            Arg::with_name("DEVICE_TTY")
                .help("the USB tty device to use")
                .long_help(
                    "the USB tty device to use; when not set, the detected \
                     serial ports are offered for selection.",
                )
                .short("-t")
                .long("--tty")
                .takes_value(true)
                .require_equals(true),
        )
        .arg(
            Arg::with_name("BAUD_RATE")
                .help("serial port baud rate")
                .short("-b")
                .long("--baud-rate")
                .takes_value(true)
                .default_value("115200")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("DATA_BITS")
                .help("number of bits per character")
                .short("-d")
                .long("--data-bits")
                .takes_value(true)
                .possible_values(&["5", "6", "7", "8"])
                .default_value("8")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("STOP_BITS")
                .help("number of stop bits per byte")
                .short("-s")
                .long("--stop-bits")
                .takes_value(true)
                .possible_values(&["1", "2"])
                .default_value("1")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PARITY")
                .help("parity checking protocol")
                .short("-p")
                .long("--parity")
                .takes_value(true)
                .possible_values(&["none", "odd", "even"])
                .default_value("none")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("FLOW_CONTROL")
                .help("flow control mode")
                .short("-f")
                .long("--flow-control")
                .takes_value(true)
                .possible_values(&["none", "soft", "hard"])
                .default_value("none")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("ADDRESS")
                .help("flash address used when the manifest has none")
                .long("--address")
                .takes_value(true)
                .default_value("0x10000")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("CHUNK_SIZE")
                .help("size in bytes of each slice pushed to the device")
                .long("--chunk-size")
                .takes_value(true)
                .default_value("16384")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("PACING_MS")
                .help("pause in milliseconds after each slice")
                .long("--pacing-ms")
                .takes_value(true)
                .default_value("20")
                .require_equals(true),
        )
        .arg(
            Arg::with_name("NO_RESET")
                .help("do not reset the device into its bootloader on connect")
                .long("--no-reset"),
        )
        .arg(
            Arg::with_name("ENFORCE_DIGEST")
                .help("refuse images whose SHA-256 differs from the manifest")
                .long("--enforce-digest"),
        )
        .arg(
            Arg::with_name("YES")
                .help("answer yes to every confirmation")
                .short("-y")
                .long("--yes"),
        )
        .arg(Arg::with_name("v").short("v").multiple(true).help(
            "Sets the logging level of verbosity, repeat several times for \
                higher verbosity",
        ))
        .get_matches();

    // Vary the output based on how many times the user used the "verbose" flag
    // (i.e. 'flashcom -v -v -v' or 'flashcom -vvv' vs 'flashcom -v'
    let log_level = match matches.occurrences_of("v") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    if let Err(e) = TermLogger::init(
        log_level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ) {
        eprintln!("logging disabled: {}", e);
    }

    trace!("{:#?}", matches);

    // Arguments with default values ===========================================

    // It's safe to call unwrap on all command line arguments with default
    // values, because the value with either be what the user input at runtime
    // or the default value

    let baud_rate = numeric_or_exit::<u32>(&matches, "BAUD_RATE", "baud-rate");
    let chunk_size = numeric_or_exit::<usize>(&matches, "CHUNK_SIZE", "chunk-size");
    let pacing_ms = numeric_or_exit::<u64>(&matches, "PACING_MS", "pacing-ms");

    let address_text = matches.value_of("ADDRESS").unwrap();
    let address = parse_address(address_text).unwrap_or_else(|| {
        invalid_value("address", address_text, "a decimal or 0x-prefixed hex value")
    });

    let data_bits = match matches.value_of("DATA_BITS").unwrap() {
        "5" => DataBits::Five,
        "6" => DataBits::Six,
        "7" => DataBits::Seven,
        "8" => DataBits::Eight,
        _ => unreachable!(),
    };

    let stop_bits = match matches.value_of("STOP_BITS").unwrap() {
        "1" => StopBits::One,
        "2" => StopBits::Two,
        _ => unreachable!(),
    };

    let parity = match matches.value_of("PARITY").unwrap() {
        "none" => Parity::None,
        "even" => Parity::Even,
        "odd" => Parity::Odd,
        _ => unreachable!(),
    };

    let flow_control = match matches.value_of("FLOW_CONTROL").unwrap() {
        "none" => FlowControl::None,
        "soft" => FlowControl::Software,
        "hard" => FlowControl::Hardware,
        _ => unreachable!(),
    };

    // END - Arguments with default values =====================================

    let manifest_location = matches.value_of("MANIFEST").unwrap();

    let mut builder = fc::SettingsBuilder::new()
        .baud_rate(baud_rate)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .flow_control(flow_control)
        .manifest(manifest_location)
        .default_flash_address(address)
        .chunk_size(chunk_size)
        .pacing(Duration::from_millis(pacing_ms))
        .auto_reset(!matches.is_present("NO_RESET"))
        .enforce_digest(matches.is_present("ENFORCE_DIGEST"));

    if let Some(tty) = matches.value_of("DEVICE_TTY") {
        builder = builder.path(tty);
    }
    let settings = builder.finalize();

    // END - Arguments =========================================================

    let manifest = Manifest::load(manifest_location);
    if matches.is_present("LIST") {
        for key in manifest.selections() {
            println!(
                "{} {} {}",
                style(key.variant()).cyan(),
                key.revision(),
                key.module()
            );
        }
        process::exit(0);
    }

    let selection = match selection_from_args(&matches) {
        Some(selection) => selection,
        None => match select_interactive(&manifest) {
            Some(key) => key.into(),
            None => {
                println!("{}", style("[FC] 🙁 nothing to flash").yellow());
                process::exit(1);
            }
        },
    };

    // Run the provisioning pipeline ===========================================

    let mut orchestrator = Orchestrator::new(
        settings,
        Box::new(SerialAuthority),
        BootloaderCapability::Unavailable,
        Box::new(TermConfirmation {
            assume_yes: matches.is_present("YES"),
        }),
        Box::new(TermObserver::default()),
    );

    let exit_code = match run(&mut orchestrator, manifest, selection) {
        Ok(()) => 0,
        Err(e) => {
            debug!("{:?}", e);
            1
        }
    };
    let _ = orchestrator.dispatch(Command::Disconnect);
    debug!("exit code: {}", exit_code);
    process::exit(exit_code);
}

fn run(
    orchestrator: &mut Orchestrator,
    manifest: Manifest,
    selection: Selection,
) -> Result<(), ProvisionError> {
    orchestrator.dispatch(Command::LoadManifest(manifest))?;
    orchestrator.dispatch(Command::Select(selection))?;
    orchestrator.dispatch(Command::Connect)?;
    orchestrator.dispatch(Command::Provision)?;
    Ok(())
}

fn numeric_or_exit<T: std::str::FromStr>(matches: &ArgMatches, name: &str, flag: &str) -> T {
    value_t!(matches, name, T)
        .unwrap_or_else(|_| invalid_value(flag, matches.value_of(name).unwrap_or(""), "a number"))
}

fn invalid_value(flag: &str, value: &str, expected: &str) -> ! {
    println!(
        "{}: `{}` needs to be {}",
        style("error").red(),
        style(flag).cyan(),
        expected
    );
    println!(
        "   {} `{}` is not a valid value",
        style("-->").cyan(),
        style(value).on_red()
    );
    process::exit(-1);
}

fn parse_address(text: &str) -> Option<u32> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn selection_from_args(matches: &ArgMatches) -> Option<Selection> {
    let selection = Selection {
        variant: matches.value_of("VARIANT").map(String::from),
        revision: matches.value_of("REVISION").map(String::from),
        module: matches.value_of("MODULE").map(String::from),
    };
    selection.key().map(|_| selection)
}

fn select_interactive(manifest: &Manifest) -> Option<SelectionKey> {
    let mut keys = manifest.selections();
    if keys.is_empty() {
        debug!("the manifest publishes no firmware");
        return None;
    }

    let items: Vec<String> = keys
        .iter()
        .map(|k| format!("{} / {} / {}", k.variant(), k.revision(), k.module()))
        .collect();
    let selection = Select::with_theme(&ColorfulTheme::default())
        .items(&items)
        .with_prompt(format!(
            "Select the firmware to flash (`{}` to cancel):",
            style("Esc").cyan()
        ))
        .default(0)
        .interact_on_opt(&Term::stdout());

    match selection {
        Ok(Some(index)) => Some(keys.swap_remove(index)),
        Ok(None) => None,
        Err(ref e) => {
            debug!("error: {}", e);
            None
        }
    }
}

// -----------------------------------------------------------------------------
// Terminal collaborators
// -----------------------------------------------------------------------------

struct TermConfirmation {
    assume_yes: bool,
}
impl Confirmation for TermConfirmation {
    fn confirm(&mut self, prompt: &str) -> bool {
        if self.assume_yes {
            println!("[FC] {} {}", prompt, style("yes").green());
            return true;
        }
        Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(false)
            .interact()
            .unwrap_or(false)
    }
}

#[derive(Default)]
struct TermObserver {
    bar: Option<(ProgressKind, ProgressBar)>,
}
impl TermObserver {
    fn bar_for(&mut self, kind: ProgressKind, progress: &TransferProgress) -> &ProgressBar {
        let stale = match &self.bar {
            Some((current, bar)) => *current != kind || progress.loaded < bar.position(),
            None => true,
        };
        if stale {
            self.finish_bar();
            let verb = match kind {
                ProgressKind::Download => "⏬ Downloading",
                ProgressKind::Transfer => "⏩ Pushing",
            };
            let bar = match progress.total {
                Some(total) => {
                    let bar = ProgressBar::new(total);
                    bar.set_style(
                        ProgressStyle::default_bar()
                            .template(&format!(
                                "[FC] {} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{eta}})",
                                verb
                            ))
                            .progress_chars("=>-"),
                    );
                    bar
                }
                None => {
                    let bar = ProgressBar::new_spinner();
                    bar.set_style(
                        ProgressStyle::default_spinner()
                            .template(&format!("[FC] {{spinner:.blue}} {} {{bytes}}", verb)),
                    );
                    bar
                }
            };
            self.bar = Some((kind, bar));
        }
        match &self.bar {
            Some((_, bar)) => bar,
            None => unreachable!(),
        }
    }

    fn finish_bar(&mut self) {
        if let Some((_, bar)) = self.bar.take() {
            bar.finish();
        }
    }

    fn say(&self, line: String) {
        match &self.bar {
            Some((_, bar)) => bar.println(line),
            None => println!("{}", line),
        }
    }
}
impl Observer for TermObserver {
    fn phase(&mut self, phase: Phase) {
        match phase {
            Phase::Verifying | Phase::Transferring | Phase::Completed | Phase::Failed => {
                self.finish_bar()
            }
            _ => {}
        }
    }

    fn progress(&mut self, kind: ProgressKind, progress: TransferProgress) {
        let bar = self.bar_for(kind, &progress);
        bar.set_position(progress.loaded);
        if progress.is_indeterminate() {
            bar.tick();
        }
    }

    fn resolved(&mut self, resolution: &Resolution) {
        match resolution {
            Resolution::Found(d) => self.say(format!(
                "[FC] 📦 firmware {} is available",
                style(&d.version).green()
            )),
            Resolution::NotFound => self.say(format!(
                "{}",
                style("[FC] 🙁 no firmware is published for this selection").yellow()
            )),
            Resolution::Undetermined => debug!("selection is not complete yet"),
        }
    }

    fn connection(&mut self, name: Option<&str>) {
        match name {
            Some(name) => self.say(format!("[FC] 🔌 connected to {}", style(name).green())),
            None => self.say("[FC] 🔌 disconnected".into()),
        }
    }

    fn message(&mut self, message: &str) {
        self.say(format!("[FC] {}", message));
    }

    fn failed(&mut self, error: &ProvisionError) {
        self.finish_bar();
        self.say(format!("{}", style(format!("[FC] 💥 {}", error)).red()));
    }
}
