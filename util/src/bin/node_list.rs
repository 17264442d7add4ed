use axon::global;
use axon::message::GraphLink;
use axon::resolver::Client;
use clap::Arg;
use std::time::Duration;

fn print_links(heading: &str, links: &[GraphLink], forward: &str, reverse: &str) {
    if links.is_empty() {
        return;
    }
    println!("{}:", heading);
    for link in links {
        let relation = if link.reversed { reverse } else { forward };
        println!("  {} {} {}", link.node_name, relation, link.other_name);
    }
}

fn main() {
    let matches = global::parse(
        global::app("node_list", "Prints the nodes and links of the active network.").arg(
            Arg::with_name("timeout")
                .long("timeout")
                .value_name("MS")
                .help("Reply timeout in milliseconds (default 5000)")
                .takes_value(true),
        ),
    );

    let timeout: u64 = matches
        .value_of("timeout")
        .map(|raw| {
            raw.parse().unwrap_or_else(|_| {
                eprintln!("error: invalid timeout '{}'", raw);
                std::process::exit(1);
            })
        })
        .unwrap_or(5000);

    let log = quark::logging::init(global::console_level());
    let mut client = Client::new(log);
    client.set_read_timeout(Some(Duration::from_millis(timeout)));

    let graph = match client.get_graph() {
        Ok(graph) => graph,
        Err(err) => {
            eprintln!("failed to fetch the graph: {}", err);
            std::process::exit(2);
        }
    };

    println!("nodes:");
    for node in &graph.nodes {
        println!("  {}", node);
    }
    print_links("topics", &graph.node_topic, "publishes", "subscribes to");
    print_links("services", &graph.node_service, "offers", "uses");

    client.cleanup();
}
