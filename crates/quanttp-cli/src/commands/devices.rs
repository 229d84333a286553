use super::{DeviceArgs, make_registry};

pub fn run(args: &DeviceArgs) -> Result<(), String> {
    let registry = make_registry(args)?;

    println!("Found {} entropy device(s):\n", registry.len());
    for source in registry.sources() {
        println!(
            "  {:<10} {:<9} {}",
            source.id(),
            source.status().to_string(),
            source.description()
        );
    }
    Ok(())
}
