use quanttp_core::Limits;
use quanttp_server::ServerConfig;

use super::{DeviceArgs, make_registry};

pub fn run(
    name: String,
    host: String,
    port: u16,
    limits: Limits,
    devices: &DeviceArgs,
) -> Result<(), String> {
    let registry = make_registry(devices)?;
    let ids = registry.list_ids().join(", ");
    let base = format!("http://{host}:{port}");

    println!("quanttp server v{}", quanttp_core::VERSION);
    println!("   {base}  (pod \"{name}\")");
    println!("   devices: {ids}");
    println!();
    println!("   Endpoints:");
    println!("     GET /                      API index (try: curl {base})");
    println!("     GET /api/randint32         One integer as text");
    println!("     GET /api/randhex?length=N  N random bytes as hex");
    println!("     GET /api/json/randhex?length=N&size=M");
    println!("     GET /api/status            Device status");
    println!("     WS  /ws                    Streaming: SUBSCRIBEINT32, UNSUBSCRIBE, ...");
    if registry.len() > 1 {
        println!();
        println!("   Several devices: add ?deviceId=<serial> to every request");
    }
    println!();

    let config = ServerConfig {
        name,
        host,
        port,
        limits,
    };

    let rt = tokio::runtime::Runtime::new().map_err(|e| format!("tokio runtime: {e}"))?;
    rt.block_on(quanttp_server::run_server(registry, config))
        .map_err(|e| format!("server: {e}"))
}
