//! lista-ctl CLI tool
//!
//! Sends one command to a running lista-node and prints the reply.
//!
//! Usage:
//!   lista-ctl add <text> [list_id]
//!   lista-ctl done <text>
//!   lista-ctl undone <text>
//!   lista-ctl delete <text>
//!   lista-ctl items
//!   lista-ctl identity
//!   lista-ctl group
//!   lista-ctl join <group_key>
//!   lista-ctl resync
//!   lista-ctl watch
//!   lista-ctl ping

use lista_engine::{Command, Response};
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn print_usage() {
    eprintln!("lista-ctl - Control a running Lista node");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  lista-ctl add <text> [list_id]   Add an item");
    eprintln!("  lista-ctl done <text>            Mark an item as done");
    eprintln!("  lista-ctl undone <text>          Mark an item as not done");
    eprintln!("  lista-ctl delete <text>          Delete an item");
    eprintln!("  lista-ctl items                  Print the list");
    eprintln!("  lista-ctl identity               Print this device's writer key");
    eprintln!("  lista-ctl group                  Print the group key to share");
    eprintln!("  lista-ctl join <group_key>       Join another device's list");
    eprintln!("  lista-ctl resync                 Pull and merge again");
    eprintln!("  lista-ctl watch                  Stream notifications");
    eprintln!("  lista-ctl ping                   Check if the node is running");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  LISTA_SOCKET  Path to IPC socket (default: ./lista-data/lista.sock)");
}

fn get_socket_path() -> PathBuf {
    std::env::var("LISTA_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./lista-data/lista.sock"))
}

fn connect() -> Result<UnixStream, String> {
    let socket_path = get_socket_path();
    UnixStream::connect(&socket_path).map_err(|e| {
        format!(
            "Failed to connect to lista-node at {:?}: {}\n\
             Is the lista-node running?",
            socket_path, e
        )
    })
}

fn send_line(stream: &mut UnixStream, line: &str) -> Result<(), String> {
    writeln!(stream, "{}", line).map_err(|e| e.to_string())
}

fn send_command(cmd: Command) -> Result<Response, String> {
    let mut stream = connect()?;
    let cmd_json = serde_json::to_string(&cmd).map_err(|e| e.to_string())?;
    send_line(&mut stream, &cmd_json)?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .map_err(|e| e.to_string())?;

    serde_json::from_str(&response_line).map_err(|e| format!("Invalid response: {}", e))
}

fn watch() -> Result<(), String> {
    let mut stream = connect()?;
    send_line(&mut stream, r#"{"cmd":"subscribe"}"#)?;
    let reader = BufReader::new(&stream);
    for line in reader.lines() {
        println!("{}", line.map_err(|e| e.to_string())?);
    }
    Ok(())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn require_arg(args: &[String], name: &str) -> String {
    match args.get(2) {
        Some(arg) => arg.clone(),
        None => {
            eprintln!("Error: {} requires a {} argument", args[1], name);
            std::process::exit(1);
        }
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let cmd = match args[1].as_str() {
        "add" => Command::AddItem {
            text: require_arg(&args, "text"),
            list_id: args.get(3).cloned(),
        },
        "done" => Command::UpdateItem {
            item: json!({
                "text": require_arg(&args, "text"),
                "isDone": true,
                "timeOfCompletion": now_millis(),
            }),
        },
        "undone" => Command::UpdateItem {
            item: json!({
                "text": require_arg(&args, "text"),
                "isDone": false,
                "timeOfCompletion": 0,
            }),
        },
        "delete" => Command::DeleteItem {
            item: json!({ "text": require_arg(&args, "text") }),
        },
        "items" => Command::ListItems,
        "identity" => Command::GetLocalIdentityKey,
        "group" => Command::GetGroupKey,
        "join" => Command::JoinGroup {
            key: require_arg(&args, "group_key"),
        },
        "resync" => Command::RequestResync,
        "ping" => Command::Ping,
        "watch" => {
            if let Err(e) = watch() {
                eprintln!("{}", e);
                std::process::exit(1);
            }
            return;
        }
        "-h" | "--help" | "help" => {
            print_usage();
            std::process::exit(0);
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            std::process::exit(1);
        }
    };

    match send_command(cmd) {
        Ok(response) => match response {
            Response::Ok { message } => {
                println!("{}", message);
            }
            Response::Key { key } => {
                println!("{}", key);
            }
            Response::Items { items } => {
                if items.is_empty() {
                    println!("(empty)");
                } else {
                    for item in items {
                        println!("[{}] {}", if item.is_done { "x" } else { " " }, item.text);
                    }
                }
            }
            Response::NotAuthorized { message } => {
                eprintln!("{}", message);
                std::process::exit(2);
            }
            Response::Error { error } => {
                eprintln!("Error: {}", error);
                std::process::exit(1);
            }
            Response::Pong { phase, peers } => {
                println!("pong - lista-node is {:?} with {} peers", phase, peers);
            }
        },
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
