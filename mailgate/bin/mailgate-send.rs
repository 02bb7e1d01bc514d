//! Submit one email to a running gateway.
//!
//! ```text
//! mailgate-send --secret change-me --to ops@example.com --subject Hi --body Hello
//! mailgate-send --tls --ca certs/ca-cert.pem --secret change-me --to ops@example.com ...
//! ```

use std::{net::SocketAddr, path::PathBuf};

use anyhow::bail;
use clap::Parser;
use mailgate_common::EmailRequest;
use mailgate_tcp::{GatewayClient, Reply, TlsOptions};

/// Send an email through a mailgate gateway
#[derive(Parser, Debug)]
#[command(name = "mailgate-send")]
#[command(about = "Send an email through a mailgate gateway", long_about = None)]
#[command(version)]
struct Cli {
    /// Gateway address
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    address: SocketAddr,

    /// Shared secret configured on the gateway
    #[arg(short, long)]
    secret: String,

    /// Connect over TLS
    #[arg(long)]
    tls: bool,

    /// CA certificate to trust instead of the system roots
    #[arg(long, requires = "tls")]
    ca: Option<PathBuf>,

    /// Accept any server certificate (testing only)
    #[arg(long, requires = "tls")]
    insecure: bool,

    /// Name expected in the server certificate
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// Recipient; repeat for several
    #[arg(short, long, required = true)]
    to: Vec<String>,

    #[arg(long)]
    subject: String,

    /// HTML body
    #[arg(long)]
    body: String,
}

impl Cli {
    fn options(&self) -> TlsOptions {
        let options = TlsOptions::new(self.server_name.clone()).accept_invalid_certs(self.insecure);
        match &self.ca {
            Some(ca) => options.ca(ca),
            None => options,
        }
    }
}

fn report(step: &str, reply: &Reply) -> anyhow::Result<()> {
    if reply.is_error() {
        bail!("{step} refused: {}", reply.text());
    }

    println!("{}", reply.text());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut client = if cli.tls {
        GatewayClient::connect_tls(cli.address, &cli.options()).await?
    } else {
        GatewayClient::connect(cli.address).await?
    };

    report("Authentication", &client.authenticate(&cli.secret).await?)?;

    let request = EmailRequest::new(cli.to, cli.subject, cli.body);
    report("Email", &client.send(&request).await?)?;

    Ok(())
}
