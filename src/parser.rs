use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::config::FramingMode;

/// Binary header: class discriminant, 4-byte item code, big-endian payload length.
const BIN_HEADER_LEN: usize = 7;

/// Coarse category of a metadata item, derived from the binary class byte or
/// the textual `<type>` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemClass {
    Core,
    PlaybackStatus,
    Artwork,
    Unknown,
}

/// One decoded tag-value pair from the stream. Only ever produced whole: the
/// payload length matched the declared length (binary) or the closing tags
/// were all found (text).
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataItem {
    pub item_class: ItemClass,
    pub code: [u8; 4],
    pub payload: Vec<u8>,
}

impl MetadataItem {
    pub fn code_str(&self) -> String {
        String::from_utf8_lossy(&self.code).into_owned()
    }
}

fn classify(class: ItemClass, code: [u8; 4]) -> ItemClass {
    if &code == b"PICT" {
        ItemClass::Artwork
    } else {
        class
    }
}

/// Streaming item parser. Partial records are buffered across `push` calls
/// and never discarded; the framing mode is decided once (configured, or
/// probed from the first non-whitespace byte) and kept for the stream's life.
pub struct FrameParser {
    state: ParserState,
    failures: u64,
}

enum ParserState {
    /// Waiting for the first non-whitespace byte to pick a framing mode.
    Probing(Vec<u8>),
    Binary(BinaryParser),
    Text(TextParser),
}

impl FrameParser {
    pub fn new(mode: FramingMode) -> Self {
        let state = match mode {
            FramingMode::Auto => ParserState::Probing(Vec::new()),
            FramingMode::Binary => ParserState::Binary(BinaryParser::default()),
            FramingMode::Text => ParserState::Text(TextParser::default()),
        };
        Self { state, failures: 0 }
    }

    /// Items dropped so far because of malformed framing or undecodable
    /// boundaries. Never fatal; exposed for diagnostics.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Feed a chunk of transport bytes and collect every item it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<MetadataItem> {
        if let ParserState::Probing(pending) = &mut self.state {
            pending.extend_from_slice(chunk);
            let Some(first) = pending.iter().position(|b| !b.is_ascii_whitespace()) else {
                return Vec::new();
            };
            let buffered = pending.split_off(first);
            if buffered.first() == Some(&b'<') {
                log::info!("Framing probe: text records");
                self.state = ParserState::Text(TextParser::default());
            } else {
                log::info!("Framing probe: binary records");
                self.state = ParserState::Binary(BinaryParser::default());
            }
            return self.feed(&buffered);
        }
        self.feed(chunk)
    }

    fn feed(&mut self, chunk: &[u8]) -> Vec<MetadataItem> {
        let mut items = Vec::new();
        match &mut self.state {
            ParserState::Binary(parser) => self.failures += parser.feed(chunk, &mut items),
            ParserState::Text(parser) => self.failures += parser.feed(chunk, &mut items),
            ParserState::Probing(_) => unreachable!("probe resolved before feed"),
        }
        items
    }
}

/// Fixed-header binary framing: class byte, 4 ASCII code bytes, u16 length,
/// then exactly `length` payload bytes.
#[derive(Default)]
struct BinaryParser {
    buf: Vec<u8>,
}

impl BinaryParser {
    /// Returns the number of malformed headers skipped while resyncing.
    fn feed(&mut self, chunk: &[u8], items: &mut Vec<MetadataItem>) -> u64 {
        self.buf.extend_from_slice(chunk);
        let mut dropped = 0u64;

        loop {
            if self.buf.len() < BIN_HEADER_LEN {
                return dropped;
            }

            let class = match self.buf[0] {
                b'c' => ItemClass::Core,
                b's' => ItemClass::PlaybackStatus,
                _ => ItemClass::Unknown,
            };
            let code: [u8; 4] = self.buf[1..5].try_into().unwrap();

            // A header whose code bytes are not printable ASCII cannot be a
            // record boundary; shift one byte and try again so a corrupt
            // stretch loses one item, not the stream.
            if class == ItemClass::Unknown || !code.iter().all(|b| b.is_ascii_graphic()) {
                log::warn!("Malformed binary header {:02x?}, resyncing", &self.buf[..BIN_HEADER_LEN]);
                self.buf.remove(0);
                dropped += 1;
                // Count each resync stretch once, not per byte.
                while self.buf.len() >= BIN_HEADER_LEN && !plausible_header(&self.buf) {
                    self.buf.remove(0);
                }
                continue;
            }

            let length = u16::from_be_bytes([self.buf[5], self.buf[6]]) as usize;
            if self.buf.len() < BIN_HEADER_LEN + length {
                // Partial payload; carried over to the next chunk.
                return dropped;
            }

            let payload = self.buf[BIN_HEADER_LEN..BIN_HEADER_LEN + length].to_vec();
            self.buf.drain(..BIN_HEADER_LEN + length);
            items.push(MetadataItem {
                item_class: classify(class, code),
                code,
                payload,
            });
        }
    }
}

fn plausible_header(buf: &[u8]) -> bool {
    (buf[0] == b'c' || buf[0] == b's') && buf[1..5].iter().all(|b| b.is_ascii_graphic())
}

/// Tag-delimited text framing: `<item>...</item>` records located by
/// substring search. The feed is not always well-formed XML, so fields are
/// extracted by boundary search rather than a strict parse.
#[derive(Default)]
struct TextParser {
    buf: Vec<u8>,
}

const ITEM_OPEN: &[u8] = b"<item";
const ITEM_CLOSE: &[u8] = b"</item>";

impl TextParser {
    /// Returns the number of complete `<item>` records that failed to decode.
    fn feed(&mut self, chunk: &[u8], items: &mut Vec<MetadataItem>) -> u64 {
        self.buf.extend_from_slice(chunk);
        let mut dropped = 0u64;

        loop {
            let Some(start) = find(&self.buf, ITEM_OPEN) else {
                // No record boundary in sight; keep only enough tail to
                // recognize an opening tag split across chunks.
                let keep = self.buf.len().min(ITEM_OPEN.len() - 1);
                self.buf.drain(..self.buf.len() - keep);
                return dropped;
            };
            self.buf.drain(..start);

            let Some(end) = find(&self.buf, ITEM_CLOSE) else {
                // Incomplete trailing fragment; wait for more bytes.
                return dropped;
            };

            let record = self.buf[..end].to_vec();
            self.buf.drain(..end + ITEM_CLOSE.len());

            match parse_text_item(&record) {
                Some(item) => items.push(item),
                None => {
                    log::warn!(
                        "Dropping undecodable text record ({} bytes)",
                        record.len() + ITEM_CLOSE.len()
                    );
                    dropped += 1;
                }
            }
        }
    }
}

/// Decode one `<item>` body (closing tag already stripped) into an item.
fn parse_text_item(record: &[u8]) -> Option<MetadataItem> {
    let class = match field(record, b"<type>", b"</type>") {
        Some(b"core") => ItemClass::Core,
        Some(b"ssnc") => ItemClass::PlaybackStatus,
        Some(_) => ItemClass::Unknown,
        None => ItemClass::Unknown,
    };

    let code: [u8; 4] = field(record, b"<code>", b"</code>")?.try_into().ok()?;

    let payload = if let Some(encoded) = field(record, b"<data encoding=\"base64\">", b"</data>") {
        let compact: Vec<u8> = encoded
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        BASE64.decode(&compact).ok()?
    } else if let Some(raw) = field(record, b"<data>", b"</data>") {
        raw.to_vec()
    } else {
        // Items without a data element are legal (zero-length payloads).
        Vec::new()
    };

    Some(MetadataItem {
        item_class: classify(class, code),
        code,
        payload,
    })
}

/// The bytes between `open` and the next `close`, if both are present.
fn field<'a>(haystack: &'a [u8], open: &[u8], close: &[u8]) -> Option<&'a [u8]> {
    let start = find(haystack, open)? + open.len();
    let end = find(&haystack[start..], close)? + start;
    Some(&haystack[start..end])
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_item(class: u8, code: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![class];
        frame.extend_from_slice(code);
        frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn binary_single_item() {
        let mut parser = FrameParser::new(FramingMode::Binary);
        let items = parser.push(&binary_item(b'c', b"minm", b"Hello"));
        assert_eq!(items.len(), 1);
        assert_eq!(&items[0].code, b"minm");
        assert_eq!(items[0].payload, b"Hello");
        assert_eq!(items[0].item_class, ItemClass::Core);
        assert_eq!(parser.failures(), 0);
    }

    #[test]
    fn binary_header_split_across_chunks_yields_exactly_one_item() {
        let frame = binary_item(b'c', b"asar", b"Bob");
        let mut parser = FrameParser::new(FramingMode::Binary);
        assert!(parser.push(&frame[..2]).is_empty());
        assert!(parser.push(&frame[2..4]).is_empty());
        let items = parser.push(&frame[4..]);
        assert_eq!(items.len(), 1);
        assert_eq!(&items[0].code, b"asar");
        assert_eq!(items[0].payload, b"Bob");
    }

    #[test]
    fn binary_payload_split_across_chunks() {
        let frame = binary_item(b'c', b"asal", b"Blonde on Blonde");
        let mut parser = FrameParser::new(FramingMode::Binary);
        assert!(parser.push(&frame[..10]).is_empty());
        let items = parser.push(&frame[10..]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].payload, b"Blonde on Blonde");
    }

    #[test]
    fn binary_resyncs_after_garbage() {
        let mut stream = vec![0xff, 0x00, 0x13, 0x37];
        stream.extend_from_slice(&binary_item(b'c', b"minm", b"Ok"));
        let mut parser = FrameParser::new(FramingMode::Binary);
        let items = parser.push(&stream);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].payload, b"Ok");
        assert_eq!(parser.failures(), 1);
    }

    #[test]
    fn binary_two_items_in_one_chunk() {
        let mut stream = binary_item(b'c', b"minm", b"Hello");
        stream.extend_from_slice(&binary_item(b's', b"pvol", &[0x40, 0x20, 0x00, 0x00]));
        let mut parser = FrameParser::new(FramingMode::Binary);
        let items = parser.push(&stream);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].item_class, ItemClass::PlaybackStatus);
    }

    #[test]
    fn binary_pict_classified_as_artwork() {
        let mut parser = FrameParser::new(FramingMode::Binary);
        let items = parser.push(&binary_item(b's', b"PICT", &[0xff, 0xd8, 0xff]));
        assert_eq!(items[0].item_class, ItemClass::Artwork);
    }

    #[test]
    fn text_plain_data() {
        let mut parser = FrameParser::new(FramingMode::Text);
        let items = parser
            .push(b"<item><type>core</type><code>asar</code><data>Bob Dylan</data></item>");
        assert_eq!(items.len(), 1);
        assert_eq!(&items[0].code, b"asar");
        assert_eq!(items[0].payload, b"Bob Dylan");
        assert_eq!(items[0].item_class, ItemClass::Core);
    }

    #[test]
    fn text_base64_data() {
        let mut parser = FrameParser::new(FramingMode::Text);
        let items = parser.push(
            b"<item><type>core</type><code>minm</code><length>5</length>\
              <data encoding=\"base64\">SGVsbG8=</data></item>",
        );
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].payload, b"Hello");
    }

    #[test]
    fn text_incomplete_record_stays_buffered() {
        let record = b"<item><type>core</type><code>asal</code><data>Desire</data></item>";
        let mut parser = FrameParser::new(FramingMode::Text);
        assert!(parser.push(&record[..30]).is_empty());
        let items = parser.push(&record[30..]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].payload, b"Desire");
    }

    #[test]
    fn text_garbage_between_records_is_skipped() {
        let mut parser = FrameParser::new(FramingMode::Text);
        let items = parser.push(
            b"noise<item><type>ssnc</type><code>prgr</code><data>x</data></item>trailing",
        );
        assert_eq!(items.len(), 1);
        // Trailing bytes that cannot start a record must not accumulate.
        assert!(parser.push(b"more noise without tags").is_empty());
    }

    #[test]
    fn text_record_without_code_counts_as_failure() {
        let mut parser = FrameParser::new(FramingMode::Text);
        let items = parser.push(b"<item><type>core</type><data>oops</data></item>");
        assert!(items.is_empty());
        assert_eq!(parser.failures(), 1);
    }

    #[test]
    fn text_item_without_data_has_empty_payload() {
        let mut parser = FrameParser::new(FramingMode::Text);
        let items = parser.push(b"<item><type>ssnc</type><code>pend</code></item>");
        assert_eq!(items.len(), 1);
        assert!(items[0].payload.is_empty());
    }

    #[test]
    fn probe_picks_text_from_angle_bracket() {
        let mut parser = FrameParser::new(FramingMode::Auto);
        let items = parser
            .push(b"\n <item><type>core</type><code>minm</code><data>Song</data></item>");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].payload, b"Song");
    }

    #[test]
    fn probe_picks_binary_otherwise() {
        let mut parser = FrameParser::new(FramingMode::Auto);
        let items = parser.push(&binary_item(b'c', b"minm", b"Song"));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].payload, b"Song");
    }

    #[test]
    fn probe_buffers_leading_whitespace_only_chunk() {
        let mut parser = FrameParser::new(FramingMode::Auto);
        assert!(parser.push(b"  \n").is_empty());
        let items = parser.push(b"<item><type>core</type><code>asar</code><data>A</data></item>");
        assert_eq!(items.len(), 1);
    }
}
