use clap::Parser;
use rand::Rng;
use shared::{
    decode_control_body, decode_downlink, encode_control, encode_uplink, AuthRequest,
    ControlResponse, PlayerId, ResponseStatus, DEFAULT_PORT, TAG_AUTH, TEST_BOT_ID_FLOOR,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

/// Manual smoke-test client: authenticates as a test bot, checks PING/PONG,
/// streams a burst of audio frames, and prints any downlink frames it hears.
/// Run the server with --test-mode so the bot id is accepted.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Relay address to talk to
    #[clap(short, long, default_value_t = format!("127.0.0.1:{}", DEFAULT_PORT))]
    server: String,
    /// Bot id to authenticate as (must be in the test-bot range)
    #[clap(short, long, default_value_t = TEST_BOT_ID_FLOOR + 1)]
    bot_id: PlayerId,
    /// Number of audio frames to send
    #[clap(short, long, default_value = "10")]
    frames: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    let server_addr = args.server.parse::<SocketAddr>()?;
    let mut buf = [0u8; 2048];

    // Authenticate as a test bot (empty credential)
    let auth = encode_control(
        TAG_AUTH,
        &AuthRequest {
            player_id: args.bot_id.to_string(),
            voice_id: String::new(),
            command: "AUTH".to_string(),
        },
    )?;
    println!("Sending AUTH for bot {} to {}", args.bot_id, server_addr);
    socket.send_to(&auth, server_addr).await?;

    let (len, addr) = socket.recv_from(&mut buf).await?;
    println!("Received {} bytes from {}", len, addr);
    let response: ControlResponse = decode_control_body(&buf[..len])?;
    println!("AUTH response: {:?} - {}", response.status, response.message);
    if response.status != ResponseStatus::Accepted {
        println!("Authentication failed, giving up");
        return Ok(());
    }

    // Liveness check
    socket.send_to(b"PING", server_addr).await?;
    let (len, _) = socket.recv_from(&mut buf).await?;
    if &buf[..len] == b"PONG" {
        println!("PING/PONG ok");
    } else {
        println!("Unexpected PING reply: {:?}", &buf[..len]);
    }

    // Stream random audio payloads and report anything relayed back
    for i in 0..args.frames {
        let payload: Vec<u8> = {
            let mut rng = rand::thread_rng();
            (0..160).map(|_| rng.gen()).collect()
        };
        let uplink = encode_uplink(args.bot_id, &payload);
        socket.send_to(&uplink, server_addr).await?;
        println!("Sent audio frame {} ({} bytes)", i + 1, payload.len());

        match timeout(Duration::from_millis(300), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => match decode_downlink(&buf[..len]) {
                Ok(frame) => println!(
                    "Heard speaker {} at volume {:.2} ({} bytes)",
                    frame.speaker,
                    frame.volume,
                    frame.payload.len()
                ),
                Err(e) => println!("Failed to decode downlink frame: {}", e),
            },
            Ok(Err(e)) => println!("Error receiving: {}", e),
            Err(_) => println!("No downlink frame (nobody in range)"),
        }

        sleep(Duration::from_millis(100)).await;
    }

    println!("Test client finished");
    Ok(())
}
