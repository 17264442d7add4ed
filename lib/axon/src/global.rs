//! Process-wide runtime state: the parsed command-line options (name remaps,
//! console log level) and the quit flag raised by the SIGINT handler. Both
//! are configured once at program entry and read from everywhere.

use clap::{App, Arg, ArgMatches};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use quark::logging;
use quark::logging::Level;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Once, RwLock};

struct Global {
    remap_node: HashMap<String, String>,
    remap_topic: HashMap<String, String>,
    remap_service: HashMap<String, String>,
    console_level: Level,
}

impl Global {
    fn new() -> Global {
        Global {
            remap_node: HashMap::new(),
            remap_topic: HashMap::new(),
            remap_service: HashMap::new(),
            console_level: Level::Info,
        }
    }
}

lazy_static! {
    static ref GLOBAL: RwLock<Global> = RwLock::new(Global::new());
}

static QUIT: AtomicBool = AtomicBool::new(false);
static QUIT_HANDLER: Once = Once::new();

/// Builds the standard option set every node binary carries. Binaries add
/// their own arguments on top and feed the matches to `init_from_matches`.
pub fn app<'a, 'b>(name: &str, about: &'b str) -> App<'a, 'b> {
    App::new(name.to_string())
        .about(about)
        .arg(
            Arg::with_name("remap")
                .short("R")
                .long("remap")
                .value_name("OLD=NEW")
                .help("Remap any name")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("remap-node")
                .short("N")
                .long("remap-node")
                .value_name("OLD=NEW")
                .help("Remap a node name")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("remap-topic")
                .short("T")
                .long("remap-topic")
                .value_name("OLD=NEW")
                .help("Remap a topic name")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("remap-service")
                .short("S")
                .long("remap-service")
                .value_name("OLD=NEW")
                .help("Remap a service name")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("console-loglevel")
                .short("L")
                .long("console-loglevel")
                .value_name("LEVEL")
                .help("Console log level (trace/debug/info/warn/error/fatal)")
                .takes_value(true),
        )
}

/// Applies the standard options. `B0_CONSOLE_LOGLEVEL` is read first so the
/// command line wins. Malformed values are argument errors.
pub fn init_from_matches(matches: &ArgMatches) -> std::result::Result<(), String> {
    let env_level = quark::env::get("B0_CONSOLE_LOGLEVEL");
    if !env_level.is_empty() {
        let level = logging::level_from_str(&env_level)
            .ok_or_else(|| format!("unknown log level '{}' in B0_CONSOLE_LOGLEVEL", env_level))?;
        set_console_level(level);
    }

    if let Some(values) = matches.values_of("remap") {
        for raw in values {
            let (old, new) = split_assignment(raw)?;
            add_remap(&old, &new);
        }
    }
    if let Some(values) = matches.values_of("remap-node") {
        for raw in values {
            let (old, new) = split_assignment(raw)?;
            add_node_remap(&old, &new);
        }
    }
    if let Some(values) = matches.values_of("remap-topic") {
        for raw in values {
            let (old, new) = split_assignment(raw)?;
            add_topic_remap(&old, &new);
        }
    }
    if let Some(values) = matches.values_of("remap-service") {
        for raw in values {
            let (old, new) = split_assignment(raw)?;
            add_service_remap(&old, &new);
        }
    }

    if let Some(raw) = matches.value_of("console-loglevel") {
        let level = logging::level_from_str(raw)
            .ok_or_else(|| format!("unknown log level '{}'", raw))?;
        set_console_level(level);
    }

    Ok(())
}

/// Parses the process arguments with the given app and applies the standard
/// options, exiting with status 1 on argument errors. Returns the matches
/// so binaries can read their own arguments.
pub fn parse<'a, 'b>(app: App<'a, 'b>) -> ArgMatches<'a> {
    let matches = app.get_matches();
    if let Err(message) = init_from_matches(&matches) {
        eprintln!("error: {}", message);
        std::process::exit(1);
    }
    matches
}

fn split_assignment(raw: &str) -> std::result::Result<(String, String), String> {
    let mut parts = raw.splitn(2, '=');
    match (parts.next(), parts.next()) {
        (Some(old), Some(new)) if !old.is_empty() => Ok((old.to_string(), new.to_string())),
        _ => Err(format!("argument must be oldName=newName, got '{}'", raw)),
    }
}

/// Remaps under all three namespaces at once.
pub fn add_remap(old: &str, new: &str) {
    add_node_remap(old, new);
    add_topic_remap(old, new);
    add_service_remap(old, new);
}

pub fn add_node_remap(old: &str, new: &str) {
    let mut global = GLOBAL.write().expect("Global options lock poisoned");
    global.remap_node.insert(old.to_string(), new.to_string());
}

pub fn add_topic_remap(old: &str, new: &str) {
    let mut global = GLOBAL.write().expect("Global options lock poisoned");
    global.remap_topic.insert(old.to_string(), new.to_string());
}

pub fn add_service_remap(old: &str, new: &str) {
    let mut global = GLOBAL.write().expect("Global options lock poisoned");
    global.remap_service.insert(old.to_string(), new.to_string());
}

pub fn console_level() -> Level {
    GLOBAL.read().expect("Global options lock poisoned").console_level
}

pub fn set_console_level(level: Level) {
    GLOBAL.write().expect("Global options lock poisoned").console_level = level;
}

/// Expands `%h` to the host id and `%n` to the node name.
fn substitute(name: &str, host_id: &str, node_name: &str) -> String {
    name.replace("%h", host_id).replace("%n", node_name)
}

fn remapped(map: &HashMap<String, String>, name: &str, host_id: &str, node_name: &str) -> String {
    let target = map.get(name).map(String::as_str).unwrap_or(name);
    substitute(target, host_id, node_name)
}

/// The effective node name after remapping and substitution. `%n` expands
/// to the originally requested name.
pub fn remap_node_name(name: &str, host_id: &str) -> String {
    let global = GLOBAL.read().expect("Global options lock poisoned");
    remapped(&global.remap_node, name, host_id, name)
}

pub fn remap_topic_name(name: &str, host_id: &str, node_name: &str) -> String {
    let global = GLOBAL.read().expect("Global options lock poisoned");
    remapped(&global.remap_topic, name, host_id, node_name)
}

pub fn remap_service_name(name: &str, host_id: &str, node_name: &str) -> String {
    let global = GLOBAL.read().expect("Global options lock poisoned");
    remapped(&global.remap_service, name, host_id, node_name)
}

/// Installs the SIGINT handler raising the process-wide quit flag. Safe to
/// call from every node constructor; only the first call installs.
pub fn setup_quit_handler() {
    QUIT_HANDLER.call_once(|| {
        let _ = ctrlc::set_handler(|| {
            QUIT.store(true, Ordering::SeqCst);
        });
    });
}

/// True once SIGINT has been received (or `request_quit` called).
pub fn quit_requested() -> bool {
    QUIT.load(Ordering::SeqCst)
}

/// Raises the process-wide quit flag, as the signal handler would.
pub fn request_quit() {
    QUIT.store(true, Ordering::SeqCst);
}
