//! Startup scripts that make automation markers look ordinary.
//!
//! Injected via `AddScriptToEvaluateOnNewDocument` before any page script
//! runs. Order matters: the webdriver flag goes first, everything else
//! builds on a page that already looks unautomated.

use anyhow::Result;
use chromiumoxide::{cdp, Page};
use tracing::{debug, warn};

/// Remove `navigator.webdriver` the way real browsers report it.
const NAVIGATOR_WEBDRIVER: &str = r#"
Object.defineProperty(Object.getPrototypeOf(navigator), 'webdriver', {
    get: () => undefined,
    configurable: true,
});
"#;

/// A realistic plugin array; headless Chrome ships an empty one.
const NAVIGATOR_PLUGINS: &str = r#"
(() => {
    const mimeTypes = [
        { type: 'application/pdf', suffixes: 'pdf', description: 'Portable Document Format' },
    ];
    const makePlugin = (name, filename) => {
        const plugin = Object.create(Plugin.prototype);
        Object.defineProperties(plugin, {
            name: { value: name, enumerable: true },
            filename: { value: filename, enumerable: true },
            description: { value: 'Portable Document Format', enumerable: true },
            length: { value: mimeTypes.length, enumerable: true },
        });
        return plugin;
    };
    const plugins = [
        makePlugin('PDF Viewer', 'internal-pdf-viewer'),
        makePlugin('Chrome PDF Viewer', 'internal-pdf-viewer'),
        makePlugin('Chromium PDF Viewer', 'internal-pdf-viewer'),
    ];
    const pluginArray = Object.create(PluginArray.prototype);
    plugins.forEach((p, i) => { pluginArray[i] = p; });
    Object.defineProperty(pluginArray, 'length', { value: plugins.length });
    pluginArray.item = i => pluginArray[i] || null;
    pluginArray.namedItem = name => plugins.find(p => p.name === name) || null;
    pluginArray.refresh = () => {};
    Object.defineProperty(Object.getPrototypeOf(navigator), 'plugins', {
        get: () => pluginArray,
        configurable: true,
    });
})();
"#;

/// Plausible hardware: headless defaults leak small or zero values.
const HARDWARE_PROFILE: &str = r#"
Object.defineProperty(Object.getPrototypeOf(navigator), 'hardwareConcurrency', {
    get: () => 8,
    configurable: true,
});
Object.defineProperty(Object.getPrototypeOf(navigator), 'deviceMemory', {
    get: () => 8,
    configurable: true,
});
"#;

/// Permission queries answer like an ordinary profile: notifications
/// report 'default' instead of headless 'denied'.
const PERMISSIONS_QUERY: &str = r#"
(() => {
    const originalQuery = window.navigator.permissions.query.bind(window.navigator.permissions);
    window.navigator.permissions.query = (parameters) => (
        parameters.name === 'notifications'
            ? Promise.resolve({ state: Notification.permission === 'denied' ? 'denied' : 'default' })
            : originalQuery(parameters)
    );
})();
"#;

/// `window.chrome` runtime stub; its absence is a headless tell.
const CHROME_RUNTIME: &str = r#"
if (!window.chrome) {
    Object.defineProperty(window, 'chrome', {
        value: { runtime: {}, loadTimes: () => ({}), csi: () => ({}) },
        configurable: true,
    });
}
"#;

/// Languages aligned with the accept-language header the profile sends.
const NAVIGATOR_LANGUAGES: &str = r#"
Object.defineProperty(Object.getPrototypeOf(navigator), 'languages', {
    get: () => ['en-US', 'en'],
    configurable: true,
});
"#;

/// Scripts in injection order.
const STEALTH_SCRIPTS: &[(&str, &str)] = &[
    ("navigator_webdriver", NAVIGATOR_WEBDRIVER),
    ("navigator_plugins", NAVIGATOR_PLUGINS),
    ("hardware_profile", HARDWARE_PROFILE),
    ("permissions_query", PERMISSIONS_QUERY),
    ("chrome_runtime", CHROME_RUNTIME),
    ("navigator_languages", NAVIGATOR_LANGUAGES),
];

/// Inject every stealth script into a fresh page. Individual failures are
/// tolerated; zero successes is an error because the page would navigate
/// with automation markers fully visible.
///
/// Returns the number of scripts active.
pub async fn inject(page: &Page) -> Result<usize> {
    let mut injected = 0usize;

    for (name, source) in STEALTH_SCRIPTS {
        let result = page
            .execute(
                cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams {
                    source: (*source).to_string(),
                    include_command_line_api: None,
                    world_name: None,
                    run_immediately: None,
                },
            )
            .await;

        match result {
            Ok(_) => {
                debug!(script = name, "stealth script injected");
                injected += 1;
            }
            Err(e) => {
                warn!(script = name, "stealth script injection failed: {e}");
            }
        }
    }

    if injected == 0 {
        return Err(anyhow::anyhow!(
            "failed to inject any stealth scripts ({} attempted)",
            STEALTH_SCRIPTS.len()
        ));
    }

    debug!(
        "stealth injection complete: {}/{} scripts active",
        injected,
        STEALTH_SCRIPTS.len()
    );
    Ok(injected)
}

/// Number of scripts this module attempts to inject.
#[must_use]
pub fn script_count() -> usize {
    STEALTH_SCRIPTS.len()
}
