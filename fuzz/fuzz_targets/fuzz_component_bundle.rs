#![no_main]

use libfuzzer_sys::fuzz_target;
use plugin_manager::plugins::{ComponentBundle, PluginType};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(Some(bundle)) = ComponentBundle::parse(text) else {
        return;
    };

    // The primary type always has at least one named component
    if let Some(primary) = bundle.primary_type() {
        assert!(!bundle.names(primary).is_empty());
    }
    for plugin_type in PluginType::ALL {
        let _ = bundle.names(plugin_type);
    }
    let _ = serde_json::to_string(&bundle);
});
