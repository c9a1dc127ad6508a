#[tokio::main]
async fn main() {
    if let Err(e) = arcall_lib::run().await {
        eprintln!("arcall: {}", e);
        std::process::exit(1);
    }
}
