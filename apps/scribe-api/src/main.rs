use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = scribe_api::Args::parse();

	scribe_api::run(args).await
}
