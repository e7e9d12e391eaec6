//! Blocking reads with the default block timeout, against a scripted server.
//!
//! The server answers each connection's commands in order and can hold a
//! reply back, which is how a real Redis behaves while BLMOVE or
//! XREADGROUP BLOCK waits for data. No Docker needed.

use messaging::{
    AckMode, BrokerEndpoint, Link, Source, StartPosition, SubscribeOptions, Transport,
};
use redis_broker::{ListQueueTransport, RedisOptions, StreamsTransport};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Data shows up this long into a blocking read.
const ARRIVAL: Duration = Duration::from_secs(2);

/// A reply and how long the server sits on it.
struct Reply {
    delay: Duration,
    body: &'static str,
}

impl Reply {
    fn now(body: &'static str) -> Self {
        Self {
            delay: Duration::ZERO,
            body,
        }
    }

    fn after(delay: Duration, body: &'static str) -> Self {
        Self { delay, body }
    }
}

type Script = Arc<dyn Fn(&[String]) -> Reply + Send + Sync>;

/// Serves `script` on a local port and returns the endpoint to dial.
async fn serve(script: Script) -> BrokerEndpoint {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("redis://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(answer(socket, script.clone()));
        }
    });
    BrokerEndpoint::new([address])
}

async fn answer(socket: TcpStream, script: Script) {
    let (read, mut write) = socket.into_split();
    let mut read = BufReader::new(read);
    while let Some(command) = read_command(&mut read).await {
        let reply = script(&command);
        tokio::time::sleep(reply.delay).await;
        if write.write_all(reply.body.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// Reads one RESP array of bulk strings. `None` once the client is gone.
async fn read_command<R: AsyncBufReadExt + Unpin>(read: &mut R) -> Option<Vec<String>> {
    let count = read_header(read, '*').await?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let len = read_header(read, '$').await?;
        let mut arg = vec![0; len + 2];
        read.read_exact(&mut arg).await.ok()?;
        arg.truncate(len);
        args.push(String::from_utf8_lossy(&arg).into_owned());
    }
    Some(args)
}

async fn read_header<R: AsyncBufReadExt + Unpin>(read: &mut R, kind: char) -> Option<usize> {
    let mut line = String::new();
    if read.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    line.trim_end().strip_prefix(kind)?.parse().ok()
}

fn is(command: &[String], name: &str) -> bool {
    command
        .first()
        .is_some_and(|first| first.eq_ignore_ascii_case(name))
}

fn subscribe_options() -> SubscribeOptions {
    SubscribeOptions {
        consumer_tag: "worker-1".to_string(),
        ack_mode: AckMode::Manual,
        start: StartPosition::Earliest,
        prefetch: 1,
    }
}

#[tokio::test]
async fn test_queue_delivery_arriving_mid_block_is_received() {
    let blmoves = Arc::new(AtomicUsize::new(0));
    let script: Script = {
        let blmoves = blmoves.clone();
        Arc::new(move |command: &[String]| {
            if is(command, "PING") {
                Reply::now("+PONG\r\n")
            } else if is(command, "LMOVE") {
                // Nothing left in the processing list.
                Reply::now("$-1\r\n")
            } else if is(command, "BLMOVE") {
                if blmoves.fetch_add(1, Ordering::SeqCst) == 0 {
                    Reply::after(ARRIVAL, "$3\r\nmsg\r\n")
                } else {
                    Reply::after(Duration::from_secs(5), "$-1\r\n")
                }
            } else if is(command, "LREM") {
                Reply::now(":1\r\n")
            } else {
                Reply::now("+OK\r\n")
            }
        })
    };
    let endpoint = serve(script).await;

    let transport = ListQueueTransport::new(RedisOptions::default());
    let link = transport.dial(&endpoint).await.unwrap();
    let channel = link.open_channel().await.unwrap();
    let mut subscription = channel
        .subscribe(&Source::queue("jobs"), &subscribe_options())
        .await
        .unwrap();

    let started = Instant::now();
    let message = tokio::time::timeout(Duration::from_secs(4), subscription.next())
        .await
        .expect("delivery was not returned")
        .expect("subscription ended")
        .unwrap();
    assert!(started.elapsed() >= ARRIVAL);
    assert_eq!(&message.payload()[..], b"msg");
    assert_eq!(blmoves.load(Ordering::SeqCst), 1);

    message.ack().await.unwrap();
    assert!(link.close_signal().unwrap().borrow().is_none());
}

#[tokio::test]
async fn test_stream_ack_is_not_held_up_by_a_blocked_read() {
    let blocking_reads = Arc::new(AtomicUsize::new(0));
    let script: Script = {
        let blocking_reads = blocking_reads.clone();
        Arc::new(move |command: &[String]| {
            if is(command, "PING") {
                Reply::now("+PONG\r\n")
            } else if is(command, "XREADGROUP") {
                if !command.iter().any(|arg| arg.eq_ignore_ascii_case("BLOCK")) {
                    // No pending entries.
                    Reply::now("*-1\r\n")
                } else if blocking_reads.fetch_add(1, Ordering::SeqCst) == 0 {
                    Reply::after(
                        ARRIVAL,
                        "*1\r\n*2\r\n$6\r\nevents\r\n*1\r\n*2\r\n$3\r\n1-0\r\n*2\r\n$7\r\npayload\r\n$3\r\nmsg\r\n",
                    )
                } else {
                    Reply::after(Duration::from_secs(5), "*-1\r\n")
                }
            } else if is(command, "XACK") {
                Reply::now(":1\r\n")
            } else {
                Reply::now("+OK\r\n")
            }
        })
    };
    let endpoint = serve(script).await;

    let transport = StreamsTransport::new(RedisOptions::default());
    let link = transport.dial(&endpoint).await.unwrap();
    let channel = link.open_channel().await.unwrap();
    let mut subscription = channel
        .subscribe(&Source::topic("events", "audit"), &subscribe_options())
        .await
        .unwrap();

    let message = tokio::time::timeout(Duration::from_secs(4), subscription.next())
        .await
        .expect("entry was not returned")
        .expect("subscription ended")
        .unwrap();
    assert_eq!(&message.payload()[..], b"msg");

    // The subscription goes back to blocking while the entry is handled.
    let reading = tokio::spawn(async move { subscription.next().await.map(|r| r.is_ok()) });
    while blocking_reads.load(Ordering::SeqCst) < 2 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    tokio::time::timeout(Duration::from_secs(1), message.ack())
        .await
        .expect("ack waited behind the blocked read")
        .unwrap();
    reading.abort();
}
