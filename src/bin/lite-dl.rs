//! lite-dl - download a batch of URLs from the command line.

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

#[tokio::main]
async fn main() -> lite_dl::Result<()> {
    lite_dl::cli::run().await
}
