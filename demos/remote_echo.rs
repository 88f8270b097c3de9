use remux::{Agent, Proxy, Result, Session, SessionConfig};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

remux::remote_interface! {
    /// Text utilities hosted by the agent.
    trait TextTools {
        async fn upper(&self, text: String) -> String;
        #[wire = "upper"]
        async fn upper_all(&self, first: String, rest: Vec<String>) -> Vec<String>;
        async fn word_count(&self, text: String) -> usize;
    }
}

struct Tools;

#[remux::async_trait]
impl TextTools for Tools {
    async fn upper(&self, text: String) -> Result<String> {
        Ok(text.to_uppercase())
    }

    async fn upper_all(&self, first: String, rest: Vec<String>) -> Result<Vec<String>> {
        Ok(std::iter::once(first)
            .chain(rest)
            .map(|s| s.to_uppercase())
            .collect())
    }

    async fn word_count(&self, text: String) -> Result<usize> {
        Ok(text.split_whitespace().count())
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    println!("Agent listening on {}", addr);

    let agent_task = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await?;
        println!("Agent accepted {}", peer);
        let target: Arc<dyn TextTools> = Arc::new(Tools);
        let handle = Agent::new(stream, SessionConfig::default())
            .service("echo", |mut reader, mut writer| async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = reader.read(&mut buf).await {
                    if n == 0 || writer.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            })
            .interface("text", target)
            .start()?;
        handle.join().await
    });

    let session = Session::connect(TcpStream::connect(addr).await?, SessionConfig::default())?;

    let (mut reader, mut writer) = session.open_service("echo").await?;
    println!("Echo service on channel {}", reader.channel_id());
    for message in ["hello", "multiplexed", "world"] {
        writer.write_all(message.as_bytes()).await?;
        let mut back = vec![0u8; message.len()];
        reader.read_exact(&mut back).await?;
        println!("  echo: {}", String::from_utf8_lossy(&back));
    }

    let tools: Proxy<dyn TextTools> = session.open_interface("text").await?;
    println!("  upper: {}", tools.upper("remote call".to_string()).await?);
    println!(
        "  upper_all: {:?}",
        tools
            .upper_all("a".to_string(), vec!["b".to_string(), "c".to_string()])
            .await?
    );
    println!(
        "  word_count: {}",
        tools.word_count("one two three four".to_string()).await?
    );

    match session.open_service("missing").await {
        Ok(_) => println!("  unexpected: missing service opened"),
        Err(e) => println!("  missing service: {}", e),
    }

    println!("Stats: {}", session.multiplexor().stats());

    session.close();
    agent_task.abort();

    Ok(())
}
