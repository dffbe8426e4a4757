use anyhow::Result;

fn main() -> Result<()> {
    hostpal::cli::run()
}
