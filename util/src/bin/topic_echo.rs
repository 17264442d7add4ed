use axon::global;
use axon::Node;
use clap::Arg;

fn main() {
    let matches = global::parse(
        global::app("topic_echo", "Prints every message published on a topic.")
            .arg(
                Arg::with_name("TOPIC")
                    .help("Topic to subscribe to")
                    .required(true),
            )
            .arg(
                Arg::with_name("count")
                    .short("n")
                    .long("count")
                    .value_name("N")
                    .help("Exit after N messages")
                    .takes_value(true),
            ),
    );

    let topic = matches.value_of("TOPIC").unwrap();
    let limit: Option<u64> = matches.value_of("count").map(|raw| {
        raw.parse().unwrap_or_else(|_| {
            eprintln!("error: invalid count '{}'", raw);
            std::process::exit(1);
        })
    });

    let mut node = Node::new("topic_echo");
    let mut seen = 0u64;
    node.subscribe(topic, move |topic, payload, content_type| {
        if content_type.is_empty() {
            println!("[{}] {}", topic, String::from_utf8_lossy(payload));
        } else {
            println!(
                "[{}] ({}) {}",
                topic,
                content_type,
                String::from_utf8_lossy(payload)
            );
        }
        seen += 1;
        if let Some(limit) = limit {
            if seen >= limit {
                global::request_quit();
            }
        }
    })
    .expect("Subscription must be created before init");

    if let Err(err) = node.init() {
        eprintln!("init failed: {}", err);
        std::process::exit(2);
    }
    if let Err(err) = node.spin(100.0) {
        eprintln!("spin failed: {}", err);
        std::process::exit(2);
    }
}
