use hiven::prelude::*;
use serde_json::Value;

async fn on_message(ctx: Context, payload: Value) -> Result<(), HandlerError> {
    let msg: Message = serde_json::from_value(payload)?;

    // ignores bot messages
    if msg.author.as_ref().and_then(|a| a.bot).unwrap_or(false) {
        return Ok(());
    }

    // responds to !ping
    if msg.content.as_deref().map(str::trim) == Some("!ping") {
        if let Some(room_id) = &msg.room_id {
            ctx.http.send_message(room_id, "pong").await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let credentials = Credentials::from_env().expect("Expected HIVEN_TOKEN in environment");
    let config = GatewayConfig::from_env().expect("Invalid gateway configuration");

    let client = Client::builder()
        .config(config)
        .build()
        .expect("Failed to build client");

    client
        .on(names::READY, |_ctx: Context, _payload: Value| async move {
            println!("Connected to Hiven");
            Ok::<(), HandlerError>(())
        })
        .on(names::MESSAGE_CREATE, on_message);

    println!("Bot starting...");

    if let Err(e) = client.run(credentials).await {
        eprintln!("Client error: {}", e);
    }
}
