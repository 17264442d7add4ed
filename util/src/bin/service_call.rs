use axon::global;
use axon::Node;
use clap::Arg;
use std::io::Read;
use std::time::Duration;

fn main() {
    let matches = global::parse(
        global::app("service_call", "Calls a service once and prints the reply.")
            .arg(
                Arg::with_name("SERVICE")
                    .help("Service to call")
                    .required(true),
            )
            .arg(
                Arg::with_name("PAYLOAD")
                    .help("Request payload; '-' reads it from stdin")
                    .required(true),
            )
            .arg(
                Arg::with_name("content-type")
                    .short("t")
                    .long("content-type")
                    .value_name("TYPE")
                    .help("Content-type tag for the request")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name("timeout")
                    .long("timeout")
                    .value_name("MS")
                    .help("Reply timeout in milliseconds")
                    .takes_value(true),
            ),
    );

    let service = matches.value_of("SERVICE").unwrap();
    let content_type = matches.value_of("content-type").unwrap_or("");
    let timeout: Option<u64> = matches.value_of("timeout").map(|raw| {
        raw.parse().unwrap_or_else(|_| {
            eprintln!("error: invalid timeout '{}'", raw);
            std::process::exit(1);
        })
    });

    let payload = match matches.value_of("PAYLOAD").unwrap() {
        "-" => {
            let mut buffer = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buffer)
                .expect("Failed reading stdin");
            buffer
        }
        literal => literal.as_bytes().to_vec(),
    };

    let mut node = Node::new("service_call");
    let client = node
        .service_client(service)
        .expect("Client must be created before init");

    if let Err(err) = node.init() {
        eprintln!("init failed: {}", err);
        std::process::exit(2);
    }

    if let Some(ms) = timeout {
        node.service_client_mut(client)
            .set_read_timeout(Some(Duration::from_millis(ms)));
    }

    match node.call(client, &payload, content_type) {
        Ok((reply, reply_type)) => {
            if !reply_type.is_empty() {
                eprintln!("content-type: {}", reply_type);
            }
            println!("{}", String::from_utf8_lossy(&reply));
            node.cleanup().expect("Cleanup after call");
        }
        Err(err) => {
            eprintln!("call failed: {}", err);
            std::process::exit(2);
        }
    }
}
