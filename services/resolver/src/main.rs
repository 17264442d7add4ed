use axon::global;
use axon::resolver::Resolver;
use clap::Arg;

pub fn main() {
    let matches = global::parse(
        global::app("resolver", "Runs the name resolution and coordination service.").arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP port of the resolv service (default: B0_RESOLVER_PORT or 22000)")
                .takes_value(true),
        ),
    );

    let mut resolver = Resolver::new();

    if let Some(raw) = matches.value_of("port") {
        match raw.parse::<u16>() {
            Ok(port) => resolver.set_port(port),
            Err(_) => {
                eprintln!("error: invalid port '{}'", raw);
                std::process::exit(1);
            }
        }
    }

    if let Err(err) = resolver.init() {
        eprintln!("resolver initialization failed: {}", err);
        std::process::exit(2);
    }

    if let Err(err) = resolver.spin() {
        eprintln!("resolver terminated with error: {}", err);
        std::process::exit(2);
    }
}
