use std::io;
use tracing::error;
use xordht::*;

const HELP: &str = r"
help                 ..print help message
put <string value>   ..store value, prints its key
get <key>            ..lookup value at key
join                 ..lookup own neighbourhood
routes               ..log routing table
======\/ lower level \/======
p <id>@<ip>:<port>          ..pings the node
s <id>@<ip>:<port> <value>  ..sends store req to node
fn <id>@<ip>:<port> <key>   ..sends find_node req to node
fv <id>@<ip>:<port> <key>   ..sends find_value req to node
";

// Usage: first line of stdin is either empty or `<id>@<ip>:<port>` of a
// bootstrap node, every following line is a command.
#[tokio::main]
async fn main() {
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(tracing::Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let input = io::stdin();
    let mut buffer = String::new();
    input.read_line(&mut buffer).unwrap();

    let mut handle = Kademlia::setup();
    if !buffer.trim().is_empty() {
        handle.bootstrap(vec![buffer.parse().unwrap()]);
    }

    let handle = handle
        .address("127.0.0.1:0".parse().unwrap())
        .start()
        .await
        .unwrap();

    println!("{}", handle.local());

    loop {
        let mut buffer = String::new();
        match input.read_line(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = buffer.trim_end();
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));

        match cmd {
            "" => {}
            "h" | "help" => println!("{}", HELP),
            "put" => println!("{:?}", handle.put(rest).await),
            "get" => match rest.parse::<Key>() {
                Ok(key) => println!("{:?}", handle.get(&key).await),
                Err(e) => error!("can't get value by key: {}", e),
            },
            "join" => println!("{:?}", handle.join().await),
            "routes" => handle.log_routes().await,
            "p" | "s" | "fn" | "fv" => {
                let (dst, arg) = rest.split_once(' ').unwrap_or((rest, ""));
                let dst: Contact = match dst.parse() {
                    Ok(dst) => dst,
                    Err(e) => {
                        error!("can't parse destination: {}", e);
                        continue;
                    }
                };

                match cmd {
                    "p" => println!("{:?}", handle.ping(&dst).await),
                    "s" => println!("{:?}", handle.store(&dst, arg).await),
                    _ => match arg.parse::<Key>() {
                        Ok(key) if cmd == "fn" => {
                            println!("{:?}", handle.find_node(&dst, &key).await)
                        }
                        Ok(key) => println!("{:?}", handle.find_value(&dst, &key).await),
                        Err(e) => error!("can't parse key: {}", e),
                    },
                }
            }
            _ => {
                println!("no match");
            }
        }
    }
}
