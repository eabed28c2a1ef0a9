//! Firmware manifest and descriptor resolution.
//!
//! The manifest is a JSON object mapping `"{Variant}|{revision}|{module}"` to a
//! firmware descriptor:
//!
//! ```json
//! {
//!   "ChatBotAI|ESP32-S3-M16R8|OLED-1.3": {
//!     "version": "1.4.2",
//!     "size": 1048576,
//!     "sha256": "9f86d0…",
//!     "url": "https://example.com/chatbot-s3-oled13.bin",
//!     "address": "0x10000"
//!   },
//!   "MochiNav|ESP32-S3-ZERO|OLED-0.91": {
//!     "version": "0.9.0",
//!     "parts": [
//!       { "address": "0x0", "url": "bootloader.bin" },
//!       { "address": 32768, "data_base64": "qrvM3Q==" }
//!     ]
//!   }
//! }
//! ```
//!
//! Resolution never fails: a selection that has no entry simply has no
//! firmware published for it.

use std::collections::HashMap;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::Deserialize;

use crate::fetch;

/// Separator between the selection components in a manifest key.
pub const KEY_DELIMITER: char = '|';

/// Internal software variant identifiers and the product names the manifest
/// uses for them.
const VARIANTS: &[(&str, &str)] = &[("chatbot", "ChatBotAI"), ("mochinav", "MochiNav")];

/// Map an internal variant identifier to its manifest product name.
pub fn canonical_variant(id: &str) -> Option<&'static str> {
    VARIANTS
        .iter()
        .find(|(short, _)| *short == id)
        .map(|(_, canonical)| *canonical)
}

/// Map a manifest product name back to its internal variant identifier.
pub fn variant_id(canonical: &str) -> Option<&'static str> {
    VARIANTS
        .iter()
        .find(|(_, name)| *name == canonical)
        .map(|(short, _)| *short)
}

// =============================================================================
// Selection
// =============================================================================

/// A fully populated `(variant, revision, module)` selection.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SelectionKey {
    variant: String,
    revision: String,
    module: String,
}
impl SelectionKey {
    pub fn new<V, R, M>(variant: V, revision: R, module: M) -> Self
    where
        V: Into<String>,
        R: Into<String>,
        M: Into<String>,
    {
        SelectionKey {
            variant: variant.into(),
            revision: revision.into(),
            module: module.into(),
        }
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// The manifest key for this selection, or `None` when the variant is not
    /// one we know how to name.
    pub fn lookup_key(&self) -> Option<String> {
        let variant = canonical_variant(&self.variant)?;
        Some(format!(
            "{}{}{}{}{}",
            variant, KEY_DELIMITER, self.revision, KEY_DELIMITER, self.module
        ))
    }
}

/// The user's current, possibly incomplete, choice.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Selection {
    pub variant: Option<String>,
    pub revision: Option<String>,
    pub module: Option<String>,
}
impl Selection {
    /// Returns the key when all three components are present and not blank.
    pub fn key(&self) -> Option<SelectionKey> {
        fn present(value: &Option<String>) -> Option<&str> {
            value.as_deref().map(str::trim).filter(|v| !v.is_empty())
        }
        Some(SelectionKey::new(
            present(&self.variant)?,
            present(&self.revision)?,
            present(&self.module)?,
        ))
    }
}
impl From<SelectionKey> for Selection {
    fn from(key: SelectionKey) -> Self {
        Selection {
            variant: Some(key.variant),
            revision: Some(key.revision),
            module: Some(key.module),
        }
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// Where the bytes of one flash part come from.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum PartSource {
    /// A URL or a file path.
    Remote(String),
    /// Base64 payload embedded in the manifest.
    Inline(String),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FlashPart {
    pub address: u32,
    pub source: PartSource,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FirmwareLayout {
    /// One image written at `address`, or at the configured default.
    Single {
        source: String,
        address: Option<u32>,
    },
    /// Several parts written in the given order, each at its own address.
    MultiPart(Vec<FlashPart>),
}

/// A resolved provisioning target.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FirmwareDescriptor {
    pub version: String,
    /// Advisory image size in bytes.
    pub size: Option<u64>,
    /// Advisory SHA-256 of the image, lowercase hex.
    pub digest: Option<String>,
    pub filename: Option<String>,
    pub layout: FirmwareLayout,
}

/// Outcome of resolving a selection against the manifest.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Resolution {
    Found(FirmwareDescriptor),
    /// No firmware is published for this selection.
    NotFound,
    /// The selection is incomplete, nothing was looked up.
    Undetermined,
}
impl Resolution {
    pub fn descriptor(&self) -> Option<&FirmwareDescriptor> {
        match self {
            Resolution::Found(descriptor) => Some(descriptor),
            _ => None,
        }
    }

    pub fn into_descriptor(self) -> Option<FirmwareDescriptor> {
        match self {
            Resolution::Found(descriptor) => Some(descriptor),
            _ => None,
        }
    }
}

/// Look up the descriptor published for `key`.
pub fn resolve(key: &SelectionKey, manifest: &Manifest) -> Resolution {
    let found = key
        .lookup_key()
        .and_then(|lookup| manifest.entries.get(&lookup));
    match found {
        Some(descriptor) => Resolution::Found(descriptor.clone()),
        None => Resolution::NotFound,
    }
}

/// Same as [`resolve`] but short-circuits to `Undetermined` for an incomplete
/// selection.
pub fn resolve_selection(selection: &Selection, manifest: &Manifest) -> Resolution {
    match selection.key() {
        Some(key) => resolve(&key, manifest),
        None => Resolution::Undetermined,
    }
}

// =============================================================================
// Manifest
// =============================================================================

/// The lookup table from selection to firmware descriptor.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Manifest {
    entries: HashMap<String, FirmwareDescriptor>,
}
impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the manifest JSON. Relative `url` and `filename` values are
    /// resolved against `base`, the location the manifest was read from.
    ///
    /// Entries that are malformed or do not describe any image are skipped
    /// with a warning; only a document that is not a JSON object fails.
    pub fn parse(text: &str, base: Option<&str>) -> Result<Self, serde_json::Error> {
        let raw: HashMap<String, serde_json::Value> = serde_json::from_str(text)?;
        let mut entries = HashMap::with_capacity(raw.len());
        for (key, value) in raw {
            let parsed = serde_json::from_value::<RawDescriptor>(value)
                .map_err(|e| e.to_string())
                .and_then(|raw| raw.into_descriptor(base));
            match parsed {
                Ok(descriptor) => {
                    entries.insert(key, descriptor);
                }
                Err(reason) => warn!("skipping manifest entry `{}`: {}", key, reason),
            }
        }
        Ok(Manifest { entries })
    }

    /// Read the manifest from a URL or a file. Any failure yields an empty
    /// manifest: nothing will resolve, but nothing crashes either.
    pub fn load(location: &str) -> Self {
        let target = if fetch::is_remote(location) {
            cache_busted(location)
        } else {
            location.to_owned()
        };
        debug!("loading manifest from {}", target);

        let text = match fetch::read_text(&target) {
            Ok(text) => text,
            Err(e) => {
                warn!("manifest unavailable, continuing without firmware: {}", e);
                return Manifest::new();
            }
        };
        match Manifest::parse(&text, Some(&base_of(location))) {
            Ok(manifest) => {
                info!("manifest loaded with {} entries", manifest.len());
                manifest
            }
            Err(e) => {
                warn!("manifest is not valid JSON, continuing without firmware: {}", e);
                Manifest::new()
            }
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, descriptor: FirmwareDescriptor) {
        self.entries.insert(key.into(), descriptor);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every selection that has firmware published, sorted. Keys naming an
    /// unknown variant are left out.
    pub fn selections(&self) -> Vec<SelectionKey> {
        let mut keys: Vec<SelectionKey> = self
            .entries
            .keys()
            .filter_map(|key| {
                let mut parts = key.splitn(3, KEY_DELIMITER);
                let variant = variant_id(parts.next()?)?;
                Some(SelectionKey::new(variant, parts.next()?, parts.next()?))
            })
            .collect();
        keys.sort();
        keys
    }
}

// -----------------------------------------------------------------------------
// JSON representation
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAddress {
    Number(u64),
    Text(String),
}
impl RawAddress {
    fn parse(&self) -> Result<u32, String> {
        let value = match self {
            RawAddress::Number(n) => *n,
            RawAddress::Text(s) => {
                let s = s.trim();
                let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => s.parse::<u64>(),
                };
                parsed.map_err(|_| format!("invalid flash address `{}`", s))?
            }
        };
        if value > u64::from(u32::MAX) {
            return Err(format!("flash address {:#x} is out of range", value));
        }
        Ok(value as u32)
    }
}

#[derive(Debug, Deserialize)]
struct RawPart {
    address: RawAddress,
    url: Option<String>,
    data_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    #[serde(default)]
    version: String,
    size: Option<u64>,
    sha256: Option<String>,
    url: Option<String>,
    filename: Option<String>,
    address: Option<RawAddress>,
    #[serde(default)]
    parts: Vec<RawPart>,
}
impl RawDescriptor {
    fn into_descriptor(self, base: Option<&str>) -> Result<FirmwareDescriptor, String> {
        let layout = if !self.parts.is_empty() {
            let mut parts = Vec::with_capacity(self.parts.len());
            for part in self.parts {
                let source = match (part.url, part.data_base64) {
                    (Some(url), _) => PartSource::Remote(relative_to(base, &url)),
                    (None, Some(data)) => PartSource::Inline(data),
                    (None, None) => return Err("a part has neither `url` nor `data_base64`".into()),
                };
                parts.push(FlashPart {
                    address: part.address.parse()?,
                    source,
                });
            }
            FirmwareLayout::MultiPart(parts)
        } else {
            let source = match (&self.url, &self.filename) {
                (Some(url), _) => relative_to(base, url),
                (None, Some(filename)) => relative_to(base, filename),
                (None, None) => return Err("no `url`, `filename` or `parts`".into()),
            };
            let address = match &self.address {
                Some(address) => Some(address.parse()?),
                None => None,
            };
            FirmwareLayout::Single { source, address }
        };

        Ok(FirmwareDescriptor {
            version: self.version,
            size: self.size,
            digest: self.sha256.map(|d| d.trim().to_ascii_lowercase()),
            filename: self.filename,
            layout,
        })
    }
}

/// Append a timestamp query parameter so intermediate caches do not serve a
/// stale manifest.
fn cache_busted(url: &str) -> String {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}t={}", url, separator, stamp)
}

/// The directory-like prefix of a manifest location, with a trailing `/`.
fn base_of(location: &str) -> String {
    if fetch::is_remote(location) {
        let without_query = location.split('?').next().unwrap_or(location);
        match without_query.rfind('/') {
            Some(idx) => without_query[..=idx].to_owned(),
            None => String::new(),
        }
    } else {
        match Path::new(location).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                format!("{}/", parent.to_string_lossy())
            }
            _ => String::new(),
        }
    }
}

fn relative_to(base: Option<&str>, target: &str) -> String {
    let absolute = fetch::is_remote(target) || Path::new(target).is_absolute();
    match base {
        Some(base) if !absolute && !base.is_empty() => format!("{}{}", base, target),
        _ => target.to_owned(),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"{
        "ChatBotAI|ESP32-S3-M16R8|OLED-1.3": {
            "version": "1.4.2",
            "size": 40000,
            "sha256": "ABCDEF",
            "url": "https://cdn.example.com/chatbot.bin"
        },
        "MochiNav|ESP32-S3-ZERO|OLED-0.96": {
            "version": "0.9.0",
            "parts": [
                { "address": "0x0", "url": "boot.bin" },
                { "address": 32768, "data_base64": "qrvM3Q==" }
            ]
        },
        "ChatBotAI|ESP32-C3|LCD-1.69": {
            "version": "1.0.0",
            "filename": "chatbot-c3.bin",
            "address": "0x20000"
        },
        "Broken|X|Y": { "version": "0.0.1" }
    }"#;

    fn manifest() -> Manifest {
        Manifest::parse(MANIFEST, Some("https://cdn.example.com/fw/")).unwrap()
    }

    #[test]
    fn resolves_published_selection() {
        let key = SelectionKey::new("chatbot", "ESP32-S3-M16R8", "OLED-1.3");
        let descriptor = resolve(&key, &manifest()).into_descriptor().unwrap();
        assert_eq!(descriptor.version, "1.4.2");
        assert_eq!(descriptor.size, Some(40000));
        assert_eq!(descriptor.digest.as_deref(), Some("abcdef"));
        assert_eq!(
            descriptor.layout,
            FirmwareLayout::Single {
                source: "https://cdn.example.com/chatbot.bin".into(),
                address: None,
            }
        );
    }

    #[test]
    fn unpublished_selection_is_not_found() {
        let key = SelectionKey::new("mochinav", "ESP32-S3-ZERO", "OLED-0.91");
        assert_eq!(resolve(&key, &manifest()), Resolution::NotFound);
    }

    #[test]
    fn unknown_variant_is_not_found() {
        let key = SelectionKey::new("ChatBotAI", "ESP32-S3-M16R8", "OLED-1.3");
        assert_eq!(resolve(&key, &manifest()), Resolution::NotFound);
    }

    #[test]
    fn incomplete_selection_is_undetermined() {
        let selection = Selection {
            variant: Some("chatbot".into()),
            revision: Some("ESP32-S3-M16R8".into()),
            module: Some("  ".into()),
        };
        assert_eq!(
            resolve_selection(&selection, &manifest()),
            Resolution::Undetermined
        );
    }

    #[test]
    fn multi_part_entries_keep_order_and_addresses() {
        let key = SelectionKey::new("mochinav", "ESP32-S3-ZERO", "OLED-0.96");
        let descriptor = resolve(&key, &manifest()).into_descriptor().unwrap();
        assert_eq!(
            descriptor.layout,
            FirmwareLayout::MultiPart(vec![
                FlashPart {
                    address: 0,
                    source: PartSource::Remote("https://cdn.example.com/fw/boot.bin".into()),
                },
                FlashPart {
                    address: 0x8000,
                    source: PartSource::Inline("qrvM3Q==".into()),
                },
            ])
        );
    }

    #[test]
    fn filename_is_resolved_against_manifest_location() {
        let key = SelectionKey::new("chatbot", "ESP32-C3", "LCD-1.69");
        let descriptor = resolve(&key, &manifest()).into_descriptor().unwrap();
        assert_eq!(
            descriptor.layout,
            FirmwareLayout::Single {
                source: "https://cdn.example.com/fw/chatbot-c3.bin".into(),
                address: Some(0x20000),
            }
        );
    }

    #[test]
    fn entries_without_image_are_skipped() {
        assert_eq!(manifest().len(), 3);
    }

    #[test]
    fn selections_map_back_to_variant_ids() {
        let selections = manifest().selections();
        assert_eq!(
            selections,
            vec![
                SelectionKey::new("chatbot", "ESP32-C3", "LCD-1.69"),
                SelectionKey::new("chatbot", "ESP32-S3-M16R8", "OLED-1.3"),
                SelectionKey::new("mochinav", "ESP32-S3-ZERO", "OLED-0.96"),
            ]
        );
    }

    #[test]
    fn invalid_address_rejects_entry() {
        let text = r#"{ "ChatBotAI|A|B": { "version": "1", "url": "x.bin", "address": "0xZZ" } }"#;
        assert!(Manifest::parse(text, None).unwrap().is_empty());
    }

    #[test]
    fn mistyped_entry_does_not_discard_the_others() {
        let text = r#"{
            "ChatBotAI|ESP32-S3-M16R8|OLED-1.3": { "version": "2", "url": "fw.bin" },
            "MochiNav|ESP32-S3-ZERO|OLED-0.91": { "version": 3, "url": "other.bin" },
            "MochiNav|ESP32-S3-ZERO|OLED-0.96": { "version": null, "url": "other.bin" },
            "ChatBotAI|ESP32-C3|LCD-1.69": { "version": "1", "size": "1048576", "url": "c3.bin" }
        }"#;
        let manifest = Manifest::parse(text, None).unwrap();
        assert_eq!(manifest.len(), 1);
        let key = SelectionKey::new("chatbot", "ESP32-S3-M16R8", "OLED-1.3");
        assert_eq!(resolve(&key, &manifest).into_descriptor().unwrap().version, "2");
    }

    #[test]
    fn mistyped_entry_in_loaded_manifest_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            r#"{
                "ChatBotAI|ESP32-S3-M16R8|OLED-1.3": { "version": "2", "url": "fw.bin" },
                "MochiNav|ESP32-S3-ZERO|OLED-0.91": { "version": 3, "url": "other.bin" }
            }"#,
        )
        .unwrap();
        assert_eq!(Manifest::load(&path.to_string_lossy()).len(), 1);
    }

    #[test]
    fn missing_manifest_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(Manifest::load(&path.to_string_lossy()).is_empty());
    }

    #[test]
    fn garbage_manifest_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(&path, "<html>not json</html>").unwrap();
        assert!(Manifest::load(&path.to_string_lossy()).is_empty());
    }

    #[test]
    fn local_manifest_resolves_relative_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        std::fs::write(
            &path,
            r#"{ "ChatBotAI|ESP32-S3-M16R8|OLED-1.3": { "version": "2", "filename": "fw.bin" } }"#,
        )
        .unwrap();
        let manifest = Manifest::load(&path.to_string_lossy());
        let key = SelectionKey::new("chatbot", "ESP32-S3-M16R8", "OLED-1.3");
        let descriptor = resolve(&key, &manifest).into_descriptor().unwrap();
        let expected = format!("{}/fw.bin", dir.path().to_string_lossy());
        assert_eq!(
            descriptor.layout,
            FirmwareLayout::Single {
                source: expected,
                address: None,
            }
        );
    }

    #[test]
    fn cache_busting_keeps_existing_query() {
        assert!(cache_busted("https://a/m.json").starts_with("https://a/m.json?t="));
        assert!(cache_busted("https://a/m.json?x=1").starts_with("https://a/m.json?x=1&t="));
    }
}
