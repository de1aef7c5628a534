use config::{Config, Environment};

use super::models::Settings;

pub fn load_config() -> Settings {
    // As Rust has no native support for .env files,
    // we use the dotenv_flow crate to import to actual ENV vars.
    let dotenv_path = dotenv_flow::dotenv_flow();
    if dotenv_path.is_ok() {
        println!("Loaded dotenv file: {:?}", dotenv_path.unwrap());
    }

    let config = Config::builder()
        .add_source(Environment::default()
            .prefix("FF2M")
            .separator("_")
            .prefix_separator("_")
            .try_parsing(true)
            .with_list_parse_key("PRINTERS.ADDRESSES")
            .list_separator(","))
            .set_default("mqtt.host", "localhost").unwrap()
            .set_default("mqtt.port", "1883").unwrap()
            .set_default("mqtt.secure", "false").unwrap()
            .set_default("mqtt.ignoretlserrors", "false").unwrap()
            .set_default("mqtt.username", "").unwrap()
            .set_default("mqtt.password", "").unwrap()
            .set_default("mqtt.clientid", "flashforge2mqtt").unwrap()
            .set_default("mqtt.roottopic", "flashforge2mqtt").unwrap()
            .set_default("mqtt.ha.enablediscovery", "false").unwrap()
            .set_default("mqtt.ha.discoverytopicprefix", "homeassistant").unwrap()
            .set_default("mqtt.ha.componentid", "flashforge2mqtt").unwrap()
            .set_default("printers.addresses", Vec::<String>::new()).unwrap()
            .set_default("printers.scaninterval", "30s").unwrap()
            .set_default("sentrydsn", "").unwrap()
        .build().unwrap();

    config.try_deserialize().unwrap()
}
