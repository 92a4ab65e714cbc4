//! The transforms that make a tunnel look like an image upload.
//!
//! On send a tunnel frame is length-prefixed, wrapped in random padding
//! blocks, XORed with a keystream, base64-encoded and streamed as HTTP
//! message bodies, each body opening with a bitmap header. On receive the
//! same transforms run in reverse order.
//!
//! None of this is a security boundary. The keystream key travels in the
//! clear at the start of the session; it only keeps the payload from looking
//! like itself.
use core::fmt::{Debug, Formatter};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::{Rng, SeedableRng, rngs::StdRng};
use zeroize::Zeroize;

use crate::{
    codec::{Decode, Decoded, Encode, Pipeline},
    error::CodecError,
    specification::{
        BMP_BITS_PER_PIXEL, BMP_HDR_LEN, BMP_HEIGHT, BMP_WIDTH, CIPHER_CONTEXT, CIPHER_KEY_LEN,
        HTTP_BODY_DATA_LEN, HTTP_HEAD_MAX_LEN, HTTP_REQUEST_HEAD, HTTP_REQUEST_LINE,
        HTTP_RESPONSE_HEAD, HTTP_STATUS_LINE, LENGTH_FRAME_MAX_LEN, LENGTH_PREFIX_LEN,
        PADDING_BLOCK_MAX_LEN, PADDING_BLOCKS_MAX, PADDING_FILL_MAX_LEN, PADDING_HDR_LEN,
    },
};

/// Builds the physical-layer pipeline of a tunnel.
///
/// The side that sends requests (`is_request`) expects responses back, and
/// the other way around.
pub fn physical_chain(is_request: bool) -> Pipeline {
    let mut pipeline = Pipeline::new();
    pipeline.push_encoder(LengthFraming);
    pipeline.push_encoder(RandomPadding::new());
    pipeline.push_encoder(KeystreamEncoder::new());
    pipeline.push_encoder(Base64Encoder);
    pipeline.push_encoder(HttpEncoder::new(is_request));
    pipeline.push_decoder(HttpDecoder::new(!is_request));
    pipeline.push_decoder(Base64Decoder);
    pipeline.push_decoder(KeystreamDecoder::default());
    pipeline.push_decoder(RandomUnpadding);
    pipeline.push_decoder(LengthUnframing);
    pipeline.sniff();
    pipeline
}

/// Prefixes each chunk with its length as a big-endian `u16`.
///
/// Inputs longer than a frame are split into several frames.
#[derive(Debug)]
pub struct LengthFraming;

impl Encode for LengthFraming {
    fn encode(&mut self, data: Vec<u8>) -> Vec<u8> {
        let frames = data.len().div_ceil(LENGTH_FRAME_MAX_LEN).max(1);
        let mut out = Vec::with_capacity(data.len() + frames * LENGTH_PREFIX_LEN);
        if data.is_empty() {
            out.extend_from_slice(&0u16.to_be_bytes());
            return out;
        }
        for chunk in data.chunks(LENGTH_FRAME_MAX_LEN) {
            out.extend_from_slice(&(chunk.len() as u16).to_be_bytes());
            out.extend_from_slice(chunk);
        }
        out
    }
}

/// Cuts the input at length prefixes.
#[derive(Debug)]
pub struct LengthUnframing;

impl Decode for LengthUnframing {
    fn decode(&mut self, input: &[u8]) -> Result<Decoded, CodecError> {
        if input.len() < LENGTH_PREFIX_LEN {
            return Ok(Decoded::incomplete());
        }
        let len = u16::from_be_bytes([input[0], input[1]]) as usize;
        let end = LENGTH_PREFIX_LEN + len;
        if input.len() < end {
            return Ok(Decoded::incomplete());
        }
        Ok(Decoded::unit(input[LENGTH_PREFIX_LEN..end].to_vec(), end))
    }

    fn name(&self) -> &'static str {
        "length"
    }
}

/// Surrounds the payload with a random number of random padding blocks.
#[derive(Debug)]
pub struct RandomPadding {
    rng: StdRng,
}

impl RandomPadding {
    /// Seeds the padding from the OS.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Uses a caller-provided rng.
    pub fn with_rng(rng: StdRng) -> Self {
        Self { rng }
    }

    fn push_padding(&mut self, out: &mut Vec<u8>) {
        let blocks = self.rng.random_range(0..=PADDING_BLOCKS_MAX);
        for _ in 0..blocks {
            let len = self.rng.random_range(1..=PADDING_FILL_MAX_LEN);
            let flag = self.rng.random::<u16>() & !1;
            out.extend_from_slice(&flag.to_be_bytes());
            out.extend_from_slice(&((len - 1) as u16).to_be_bytes());
            let start = out.len();
            out.resize(start + len, 0);
            self.rng.fill(&mut out[start..]);
        }
    }
}

impl Default for RandomPadding {
    fn default() -> Self {
        Self::new()
    }
}

impl Encode for RandomPadding {
    fn encode(&mut self, data: Vec<u8>) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 2 * PADDING_HDR_LEN + 1024);
        self.push_padding(&mut out);
        for chunk in data.chunks(PADDING_BLOCK_MAX_LEN) {
            let flag = self.rng.random::<u16>() | 1;
            out.extend_from_slice(&flag.to_be_bytes());
            out.extend_from_slice(&((chunk.len() - 1) as u16).to_be_bytes());
            out.extend_from_slice(chunk);
        }
        self.push_padding(&mut out);
        out
    }
}

/// Strips padding blocks and yields payload blocks.
#[derive(Debug)]
pub struct RandomUnpadding;

impl Decode for RandomUnpadding {
    fn decode(&mut self, input: &[u8]) -> Result<Decoded, CodecError> {
        if input.len() < PADDING_HDR_LEN {
            return Ok(Decoded::incomplete());
        }
        let flag = u16::from_be_bytes([input[0], input[1]]);
        let len = u16::from_be_bytes([input[2], input[3]]) as usize + 1;
        let end = PADDING_HDR_LEN + len;
        if input.len() < end {
            return Ok(Decoded::incomplete());
        }
        if flag & 1 == 0 {
            return Ok(Decoded::skipped(end));
        }
        Ok(Decoded::unit(input[PADDING_HDR_LEN..end].to_vec(), end))
    }

    fn name(&self) -> &'static str {
        "padding"
    }
}

fn keystream(key: &mut [u8; CIPHER_KEY_LEN]) -> blake3::OutputReader {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(CIPHER_CONTEXT);
    key.zeroize();
    hasher.finalize_xof()
}

fn apply_keystream(reader: &mut blake3::OutputReader, data: &mut [u8]) {
    let mut block = [0u8; 64];
    for chunk in data.chunks_mut(block.len()) {
        let stream = &mut block[..chunk.len()];
        reader.fill(stream);
        chunk
            .iter_mut()
            .zip(stream.iter())
            .for_each(|(byte, key)| *byte ^= key);
    }
}

/// XORs the stream with a BLAKE3 keystream.
///
/// The key is random per session and sent in front of the first chunk.
pub struct KeystreamEncoder {
    reader: blake3::OutputReader,
    pending_key: Option<[u8; CIPHER_KEY_LEN]>,
}

impl KeystreamEncoder {
    /// Draws a fresh key from the OS.
    pub fn new() -> Self {
        Self::with_rng(&mut StdRng::from_os_rng())
    }

    /// Draws the key from `rng`.
    pub fn with_rng(rng: &mut StdRng) -> Self {
        let key: [u8; CIPHER_KEY_LEN] = rng.random();
        let mut copy = key;
        Self {
            reader: keystream(&mut copy),
            pending_key: Some(key),
        }
    }
}

impl Default for KeystreamEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for KeystreamEncoder {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KeystreamEncoder")
            .field("key_sent", &self.pending_key.is_none())
            .finish()
    }
}

impl Drop for KeystreamEncoder {
    fn drop(&mut self) {
        if let Some(key) = self.pending_key.as_mut() {
            key.zeroize();
        }
    }
}

impl Encode for KeystreamEncoder {
    fn encode(&mut self, mut data: Vec<u8>) -> Vec<u8> {
        apply_keystream(&mut self.reader, &mut data);
        match self.pending_key.take() {
            Some(mut key) => {
                let mut out = Vec::with_capacity(CIPHER_KEY_LEN + data.len());
                out.extend_from_slice(&key);
                out.extend_from_slice(&data);
                key.zeroize();
                out
            }
            None => data,
        }
    }
}

/// Reads the session key, then XORs the rest of the stream.
#[derive(Default)]
pub struct KeystreamDecoder {
    reader: Option<blake3::OutputReader>,
}

impl Debug for KeystreamDecoder {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KeystreamDecoder")
            .field("keyed", &self.reader.is_some())
            .finish()
    }
}

impl Decode for KeystreamDecoder {
    fn decode(&mut self, input: &[u8]) -> Result<Decoded, CodecError> {
        match self.reader.as_mut() {
            Some(reader) => {
                let mut data = input.to_vec();
                apply_keystream(reader, &mut data);
                Ok(Decoded::unit(data, input.len()))
            }
            None => {
                if input.len() < CIPHER_KEY_LEN {
                    return Ok(Decoded::incomplete());
                }
                let mut key = [0u8; CIPHER_KEY_LEN];
                key.copy_from_slice(&input[..CIPHER_KEY_LEN]);
                self.reader = Some(keystream(&mut key));
                Ok(Decoded::skipped(CIPHER_KEY_LEN))
            }
        }
    }

    fn name(&self) -> &'static str {
        "keystream"
    }
}

/// Standard padded base64 of each chunk.
#[derive(Debug)]
pub struct Base64Encoder;

impl Encode for Base64Encoder {
    fn encode(&mut self, data: Vec<u8>) -> Vec<u8> {
        STANDARD.encode(data).into_bytes()
    }
}

/// Decodes whole quads, one encoder segment at a time.
///
/// Every encoded chunk ends with its own padding, so a quad containing `=`
/// closes a segment and the next quad starts a new one.
#[derive(Debug)]
pub struct Base64Decoder;

impl Decode for Base64Decoder {
    fn decode(&mut self, input: &[u8]) -> Result<Decoded, CodecError> {
        let whole = input.len() / 4 * 4;
        let end = input[..whole]
            .chunks(4)
            .position(|quad| quad.contains(&b'='))
            .map(|i| (i + 1) * 4)
            .unwrap_or(whole);
        if end == 0 {
            return Ok(Decoded::incomplete());
        }
        let decoded = STANDARD
            .decode(&input[..end])
            .map_err(|_| CodecError::Malformed {
                stage: "base64",
                reason: "invalid base64",
            })?;
        Ok(Decoded::unit(decoded, end))
    }

    fn name(&self) -> &'static str {
        "base64"
    }
}

fn bmp_header(file_size: usize) -> [u8; BMP_HDR_LEN] {
    let mut hdr = [0u8; BMP_HDR_LEN];
    let image_size = (file_size - BMP_HDR_LEN) as u32;
    hdr[0..2].copy_from_slice(b"BM");
    hdr[2..6].copy_from_slice(&(file_size as u32).to_le_bytes());
    hdr[10..14].copy_from_slice(&(BMP_HDR_LEN as u32).to_le_bytes());
    hdr[14..18].copy_from_slice(&40u32.to_le_bytes());
    hdr[18..22].copy_from_slice(&BMP_WIDTH.to_le_bytes());
    hdr[22..26].copy_from_slice(&BMP_HEIGHT.to_le_bytes());
    hdr[26..28].copy_from_slice(&1u16.to_le_bytes());
    hdr[28..30].copy_from_slice(&BMP_BITS_PER_PIXEL.to_le_bytes());
    hdr[34..38].copy_from_slice(&image_size.to_le_bytes());
    hdr[38..42].copy_from_slice(&2835i32.to_le_bytes());
    hdr[42..46].copy_from_slice(&2835i32.to_le_bytes());
    hdr
}

/// Streams the input as HTTP message bodies of fixed size.
///
/// A body that is not full when the input runs out is continued by the next
/// call.
#[derive(Debug)]
pub struct HttpEncoder {
    head: &'static str,
    remain: usize,
}

impl HttpEncoder {
    /// Emits `POST` requests if `is_request`, `200 OK` responses otherwise.
    pub fn new(is_request: bool) -> Self {
        Self {
            head: if is_request {
                HTTP_REQUEST_HEAD
            } else {
                HTTP_RESPONSE_HEAD
            },
            remain: 0,
        }
    }
}

impl Encode for HttpEncoder {
    fn encode(&mut self, data: Vec<u8>) -> Vec<u8> {
        if data.len() <= self.remain {
            self.remain -= data.len();
            return data;
        }

        let mut out = Vec::with_capacity(data.len() + 256);
        let mut data = &data[..];
        if self.remain > 0 {
            out.extend_from_slice(&data[..self.remain]);
            data = &data[self.remain..];
            self.remain = 0;
        }
        let content_length = BMP_HDR_LEN + HTTP_BODY_DATA_LEN;
        while !data.is_empty() {
            out.extend_from_slice(self.head.as_bytes());
            out.extend_from_slice(format!("{}\r\n\r\n", content_length).as_bytes());
            out.extend_from_slice(&bmp_header(content_length));
            let n = data.len().min(HTTP_BODY_DATA_LEN);
            out.extend_from_slice(&data[..n]);
            data = &data[n..];
            self.remain = HTTP_BODY_DATA_LEN - n;
        }
        out
    }
}

/// Extracts body data from HTTP messages.
#[derive(Debug)]
pub struct HttpDecoder {
    first_line: &'static str,
    remain: usize,
}

impl HttpDecoder {
    /// Expects `POST` requests if `expect_request`, `200 OK` responses
    /// otherwise.
    pub fn new(expect_request: bool) -> Self {
        Self {
            first_line: if expect_request {
                HTTP_REQUEST_LINE
            } else {
                HTTP_STATUS_LINE
            },
            remain: 0,
        }
    }

    fn malformed(reason: &'static str) -> CodecError {
        CodecError::Malformed {
            stage: "http",
            reason,
        }
    }

    fn parse_head(&self, head: &[u8]) -> Result<usize, CodecError> {
        let head = core::str::from_utf8(head).map_err(|_| Self::malformed("head is not text"))?;
        let mut lines = head.split("\r\n");
        if lines.next() != Some(self.first_line) {
            return Err(Self::malformed("unexpected first line"));
        }
        let mut content_length = None;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                return Err(Self::malformed("bad header line"));
            };
            if name.trim().eq_ignore_ascii_case("content-length") {
                let value = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| Self::malformed("bad content length"))?;
                content_length = Some(value);
            }
        }
        match content_length {
            Some(len) if len >= BMP_HDR_LEN => Ok(len),
            Some(_) => Err(Self::malformed("body shorter than an image header")),
            None => Err(Self::malformed("missing content length")),
        }
    }
}

impl Decode for HttpDecoder {
    fn decode(&mut self, input: &[u8]) -> Result<Decoded, CodecError> {
        if self.remain > 0 {
            let n = input.len().min(self.remain);
            self.remain -= n;
            return Ok(Decoded::unit(input[..n].to_vec(), n));
        }

        // Reject a wrong first line as soon as it can no longer match.
        let expected = self.first_line.as_bytes();
        match find(input, b"\r\n") {
            Some(pos) if &input[..pos] != expected => {
                return Err(Self::malformed("unexpected first line"));
            }
            None if !expected.starts_with(&input[..input.len().min(expected.len())]) => {
                return Err(Self::malformed("unexpected first line"));
            }
            _ => {}
        }

        let Some(head_end) = find(input, b"\r\n\r\n") else {
            if input.len() > HTTP_HEAD_MAX_LEN {
                return Err(Self::malformed("head too long"));
            }
            return Ok(Decoded::incomplete());
        };
        let content_length = self.parse_head(&input[..head_end])?;
        let body = head_end + 4;
        if input.len() < body + BMP_HDR_LEN {
            return Ok(Decoded::incomplete());
        }
        let bmp = &input[body..body + BMP_HDR_LEN];
        if &bmp[0..2] != b"BM" {
            return Err(Self::malformed("body is not a bitmap"));
        }
        let file_size = u32::from_le_bytes([bmp[2], bmp[3], bmp[4], bmp[5]]) as usize;
        if file_size != content_length {
            return Err(Self::malformed("bitmap size disagrees with content length"));
        }

        let data = body + BMP_HDR_LEN;
        let want = content_length - BMP_HDR_LEN;
        let n = (input.len() - data).min(want);
        self.remain = want - n;
        Ok(Decoded::unit(input[data..data + n].to_vec(), data + n))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod test {
    use crate::codec::Output;

    use super::*;

    fn seeded_chain(is_request: bool, seed: u8) -> Pipeline {
        let mut rng = StdRng::from_seed([seed; 32]);
        let mut pipeline = Pipeline::new();
        pipeline.push_encoder(LengthFraming);
        pipeline.push_encoder(RandomPadding::with_rng(StdRng::from_seed([seed ^ 0xff; 32])));
        pipeline.push_encoder(KeystreamEncoder::with_rng(&mut rng));
        pipeline.push_encoder(Base64Encoder);
        pipeline.push_encoder(HttpEncoder::new(is_request));
        pipeline.push_decoder(HttpDecoder::new(!is_request));
        pipeline.push_decoder(Base64Decoder);
        pipeline.push_decoder(KeystreamDecoder::default());
        pipeline.push_decoder(RandomUnpadding);
        pipeline.push_decoder(LengthUnframing);
        pipeline.sniff();
        pipeline
    }

    fn units(output: Output) -> Vec<Vec<u8>> {
        match output {
            Output::Units(units) => units,
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_through_full_chain() {
        let mut client = seeded_chain(true, 1);
        let mut server = seeded_chain(false, 2);
        let mut rng = StdRng::from_seed([7; 32]);

        // Empty, single byte, and lengths on and around the block sizes of
        // base64 (3), the keystream block (64) and the HTTP body (2048).
        let lens = [0, 1, 2, 3, 4, 63, 64, 65, 2047, 2048, 2049, 6144, 65513];
        for (i, &len) in lens.iter().enumerate() {
            let mut message = vec![0u8; len];
            rng.fill(&mut message[..]);

            let wire = client.encode(message.clone());
            // Deliver in uneven pieces.
            let mut got = Vec::new();
            for piece in wire.chunks(1 + i * 97) {
                got.extend(units(server.decode(piece)));
            }
            // An empty message decodes to an empty unit, which is dropped.
            assert_eq!(got.len(), usize::from(len > 0), "len {}", len);
            assert_eq!(got.concat(), message, "len {}", len);
        }

        let reply = b"pong".to_vec();
        let wire = server.encode(reply.clone());
        assert_eq!(units(client.decode(&wire)), vec![reply]);
    }

    #[test]
    fn test_wire_looks_like_http_upload() {
        let mut client = seeded_chain(true, 3);
        let wire = client.encode(b"hello".to_vec());
        assert!(wire.starts_with(b"POST /upload HTTP/1.1\r\n"));
        let text = String::from_utf8_lossy(&wire);
        assert!(text.contains("Content-Length: 2102\r\n\r\nBM"));

        let mut server = seeded_chain(false, 4);
        let wire = server.encode(b"hello".to_vec());
        assert!(wire.starts_with(b"HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn test_http_bodies_continue_across_calls() {
        let mut encoder = HttpEncoder::new(true);
        let first = encoder.encode(vec![1u8; 1000]);
        assert!(first.starts_with(b"POST"));
        // Fits in the rest of the open body: no new head.
        let second = encoder.encode(vec![2u8; 1048]);
        assert_eq!(second, vec![2u8; 1048]);
        let third = encoder.encode(vec![3u8; 10]);
        assert!(third.starts_with(b"POST"));

        let mut decoder = HttpDecoder::new(true);
        let mut wire = first;
        wire.extend(second);
        wire.extend(third);
        let mut data = Vec::new();
        let mut input = &wire[..];
        loop {
            let decoded = decoder.decode(input).unwrap();
            if decoded.consumed == 0 {
                break;
            }
            for unit in decoded.units {
                data.extend(unit);
            }
            input = &input[decoded.consumed..];
        }
        assert_eq!(data.len(), 2058);
        assert!(input.is_empty());
    }

    #[test]
    fn test_probe_fails_early() {
        let mut server = seeded_chain(false, 5);
        match server.decode(b"GET / HTTP/1.1\r\nHost: x\r\n") {
            Output::Raw { bytes, first, .. } => {
                assert!(first);
                assert_eq!(bytes, b"GET / HTTP/1.1\r\nHost: x\r\n");
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn test_partial_first_line_waits() {
        let mut decoder = HttpDecoder::new(true);
        assert_eq!(decoder.decode(b"POST /up").unwrap(), Decoded::incomplete());
        assert!(decoder.decode(b"PUT /up").is_err());
    }

    #[test]
    fn test_bad_bitmap_size() {
        let mut decoder = HttpDecoder::new(false);
        let mut wire = HTTP_RESPONSE_HEAD.as_bytes().to_vec();
        wire.extend_from_slice(b"100\r\n\r\n");
        wire.extend_from_slice(&bmp_header(2102));
        assert!(decoder.decode(&wire).is_err());
    }

    #[test]
    fn test_padding_skips_even_blocks() {
        let mut wire = vec![0, 2, 0, 2, 9, 9, 9];
        wire.extend_from_slice(&[0, 3, 0, 1, b'o', b'k']);
        let mut decoder = RandomUnpadding;
        assert_eq!(decoder.decode(&wire).unwrap(), Decoded::skipped(7));
        assert_eq!(
            decoder.decode(&wire[7..]).unwrap(),
            Decoded::unit(b"ok".to_vec(), 6)
        );
    }

    #[test]
    fn test_base64_decodes_segments() {
        let mut encoder = Base64Encoder;
        let mut wire = encoder.encode(b"a".to_vec());
        wire.extend(encoder.encode(b"bcd".to_vec()));
        wire.extend_from_slice(b"Zm");

        let mut decoder = Base64Decoder;
        let first = decoder.decode(&wire).unwrap();
        assert_eq!(first, Decoded::unit(b"a".to_vec(), 4));
        let second = decoder.decode(&wire[4..]).unwrap();
        assert_eq!(second, Decoded::unit(b"bcd".to_vec(), 4));
        assert_eq!(decoder.decode(&wire[8..]).unwrap(), Decoded::incomplete());
    }

    #[test]
    fn test_length_framing_empty_message() {
        let mut encoder = LengthFraming;
        assert_eq!(encoder.encode(Vec::new()), vec![0, 0]);
        let mut decoder = LengthUnframing;
        assert_eq!(
            decoder.decode(&[0, 0]).unwrap(),
            Decoded::unit(Vec::new(), 2)
        );
    }
}
