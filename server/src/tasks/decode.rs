//! Best-effort text decoding for task output.
//!
//! Beacons on older hosts report console output in whatever codepage the
//! shell used. [`DecodeChain`] tries an ordered list of [`TextDecoder`]s and
//! always ends with a lossy decoder, so decoding never fails.

use encoding_rs::Encoding;

pub trait TextDecoder: Send + Sync {
    fn name(&self) -> &str;
    /// `None` when the bytes are not valid in this encoding.
    fn decode(&self, bytes: &[u8]) -> Option<String>;
}

/// Strict UTF-8.
pub struct Utf8Decoder;

impl TextDecoder for Utf8Decoder {
    fn name(&self) -> &str {
        "utf-8"
    }

    fn decode(&self, bytes: &[u8]) -> Option<String> {
        std::str::from_utf8(bytes).ok().map(ToString::to_string)
    }
}

/// A legacy single- or multi-byte codepage (GBK, windows-1252, Shift_JIS, ...).
pub struct LegacyDecoder {
    encoding: &'static Encoding,
}

impl LegacyDecoder {
    /// Look up a codepage by its WHATWG label. `None` for unknown labels.
    pub fn for_label(label: &str) -> Option<Self> {
        Encoding::for_label(label.as_bytes()).map(|encoding| Self { encoding })
    }
}

impl TextDecoder for LegacyDecoder {
    fn name(&self) -> &str {
        self.encoding.name()
    }

    fn decode(&self, bytes: &[u8]) -> Option<String> {
        self.encoding
            .decode_without_bom_handling_and_without_replacement(bytes)
            .map(std::borrow::Cow::into_owned)
    }
}

/// UTF-8 with U+FFFD for every invalid sequence. Never fails.
pub struct LossyDecoder;

impl TextDecoder for LossyDecoder {
    fn name(&self) -> &str {
        "utf-8-lossy"
    }

    fn decode(&self, bytes: &[u8]) -> Option<String> {
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}

pub struct DecodeChain {
    decoders: Vec<Box<dyn TextDecoder>>,
}

impl DecodeChain {
    /// UTF-8, then the named legacy codepage (if the label is known), then lossy.
    pub fn with_legacy(label: &str) -> Self {
        let mut decoders: Vec<Box<dyn TextDecoder>> = vec![Box::new(Utf8Decoder)];
        match LegacyDecoder::for_label(label) {
            Some(legacy) => decoders.push(Box::new(legacy)),
            None => tracing::warn!(label, "Unknown legacy encoding label, skipping"),
        }
        decoders.push(Box::new(LossyDecoder));
        Self { decoders }
    }

    /// Decode `bytes`, returning the text and the name of the decoder that
    /// accepted it.
    pub fn decode(&self, bytes: &[u8]) -> (String, &str) {
        for decoder in &self.decoders {
            if let Some(text) = decoder.decode(bytes) {
                return (text, decoder.name());
            }
        }
        (LossyDecoder.decode(bytes).unwrap_or_default(), "utf-8-lossy")
    }

    pub fn decode_text(&self, bytes: &[u8]) -> String {
        self.decode(bytes).0
    }
}

impl Default for DecodeChain {
    fn default() -> Self {
        Self::with_legacy("gbk")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_wins_when_valid() {
        let chain = DecodeChain::default();
        let (text, by) = chain.decode("héllo".as_bytes());
        assert_eq!(text, "héllo");
        assert_eq!(by, "utf-8");
    }

    #[test]
    fn gbk_output_decodes_through_legacy_step() {
        // "中文" in GBK
        let bytes = [0xD6, 0xD0, 0xCE, 0xC4];
        let chain = DecodeChain::with_legacy("gbk");
        let (text, by) = chain.decode(&bytes);
        assert_eq!(text, "中文");
        assert_eq!(by, "GBK");
    }

    #[test]
    fn legacy_decoder_rejects_malformed_input() {
        let gbk = LegacyDecoder::for_label("gbk").unwrap();
        // A lead byte with no trail byte.
        assert!(gbk.decode(&[0x81]).is_none());
    }

    #[test]
    fn lossy_fallback_always_produces_text() {
        let chain = DecodeChain::with_legacy("gbk");
        let (text, by) = chain.decode(&[0x61, 0x81]);
        assert_eq!(by, "utf-8-lossy");
        assert!(text.starts_with('a'));
        assert!(text.contains('\u{FFFD}'));
    }

    #[test]
    fn single_byte_codepage_accepts_any_byte() {
        let chain = DecodeChain::with_legacy("windows-1252");
        let (text, by) = chain.decode(&[0x63, 0x61, 0x66, 0xE9]);
        assert_eq!(text, "café");
        assert_eq!(by, "windows-1252");
    }

    #[test]
    fn unknown_label_falls_back_to_utf8_and_lossy() {
        let chain = DecodeChain::with_legacy("no-such-codepage");
        assert_eq!(chain.decoders.len(), 2);
        assert_eq!(chain.decode_text(b"ok"), "ok");
    }
}
