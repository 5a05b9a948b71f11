//! Headless probe client for exercising the wire protocol against a running
//! server: handshake, a scripted walk, and a printout of everything received.

use serde_json::Value;
use server::framing::{FrameError, FramedStream};
use shared::{Message, KEY_DOWN, KEY_LEFT, KEY_RIGHT, KEY_UP};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:9042".to_string());
    let username = args.next().unwrap_or_else(|| "probe".to_string());

    let socket = TcpStream::connect(&addr).await?;
    println!("Connected to {}", addr);
    let stream = Arc::new(FramedStream::new(socket));

    stream
        .write(&Message::Username {
            username: username.clone(),
        })
        .await?;
    println!("Registered as {:?}", username);

    // Print everything the server pushes at us
    let reader = Arc::clone(&stream);
    let printer = tokio::spawn(async move {
        loop {
            match reader.read().await {
                Ok(frame) => match frame.get("type").and_then(Value::as_str) {
                    Some("update") => {
                        let lps = frame.get("lps").and_then(Value::as_u64).unwrap_or(0);
                        let players = frame
                            .get("players")
                            .and_then(Value::as_object)
                            .map(|map| map.len())
                            .unwrap_or(0);
                        let joined = frame
                            .get("newPlayers")
                            .and_then(Value::as_object)
                            .map(|map| map.len())
                            .unwrap_or(0);
                        println!(
                            "update: lps={} players={} new={} gone={}",
                            lps,
                            players,
                            joined,
                            frame
                                .get("goneUsernames")
                                .and_then(Value::as_array)
                                .map(|gone| gone.len())
                                .unwrap_or(0)
                        );
                    }
                    Some("dead") => {
                        println!("We died!");
                        break;
                    }
                    Some("close") => {
                        println!("Server closed the session: {:?}", frame.get("message"));
                        break;
                    }
                    other => println!("Unexpected message type: {:?}", other),
                },
                Err(FrameError::Closed) => {
                    println!("Connection closed");
                    break;
                }
                Err(e) => {
                    println!("Read failed: {}", e);
                    break;
                }
            }
        }
    });

    // Walk a small square so movement shows up in the updates
    let directions = [KEY_RIGHT, KEY_DOWN, KEY_LEFT, KEY_UP];
    for state in directions.iter().cycle().take(12) {
        if printer.is_finished() {
            break;
        }
        if stream.write(&Message::Keyboard { state: *state }).await.is_err() {
            break;
        }
        sleep(Duration::from_millis(500)).await;
    }

    let _ = stream.write(&Message::Keyboard { state: 0 }).await;
    stream.close().await;
    let _ = printer.await;
    println!("Probe finished");
    Ok(())
}
