use axon::global;
use axon::Node;
use clap::Arg;
use std::time::Duration;

fn main() {
    let matches = global::parse(
        global::app("topic_publish", "Publishes one message on a topic.")
            .arg(
                Arg::with_name("TOPIC")
                    .help("Topic to publish on")
                    .required(true),
            )
            .arg(
                Arg::with_name("PAYLOAD")
                    .help("Payload bytes")
                    .required(true),
            )
            .arg(
                Arg::with_name("content-type")
                    .short("t")
                    .long("content-type")
                    .value_name("TYPE")
                    .help("Content-type tag for the payload")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name("repeat")
                    .short("r")
                    .long("repeat")
                    .value_name("HZ")
                    .help("Publish repeatedly at the given rate instead of once")
                    .takes_value(true),
            ),
    );

    let topic = matches.value_of("TOPIC").unwrap();
    let payload = matches.value_of("PAYLOAD").unwrap().as_bytes().to_vec();
    let content_type = matches.value_of("content-type").unwrap_or("");
    let rate: Option<f64> = matches.value_of("repeat").map(|raw| {
        raw.parse().unwrap_or_else(|_| {
            eprintln!("error: invalid rate '{}'", raw);
            std::process::exit(1);
        })
    });

    let mut node = Node::new("topic_publish");
    let publisher = node
        .advertise(topic)
        .expect("Publisher must be created before init");

    if let Err(err) = node.init() {
        eprintln!("init failed: {}", err);
        std::process::exit(2);
    }

    match rate {
        None => {
            // Give the broker a moment to see the connection before the
            // one-shot publish.
            std::thread::sleep(Duration::from_millis(200));
            if let Err(err) = node.publish(publisher, &payload, content_type) {
                eprintln!("publish failed: {}", err);
                std::process::exit(2);
            }
            node.cleanup().expect("Cleanup after publish");
        }
        Some(rate) => {
            let pause = Duration::from_secs_f64(1.0 / rate);
            while !node.shutdown_requested() {
                if let Err(err) = node.publish(publisher, &payload, content_type) {
                    eprintln!("publish failed: {}", err);
                    break;
                }
                std::thread::sleep(pause);
            }
            node.cleanup().expect("Cleanup after publish loop");
        }
    }
}
