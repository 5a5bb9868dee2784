//! iSyntax XML header parsing.
//!
//! The container opens with a UTF-8 XML document terminated by a lone `0x04`
//! byte. The document is a tree of `<DataObject>`, `<Attribute>` and
//! `<Array>` elements; every `<Attribute>` carries a `(Name, Group, Element,
//! PMSVR)` tuple addressing a DICOM-style field.
//!
//! The scanner below walks the bytes once with an explicit element stack.
//! Nested attributes give each leaf a *context*: a dimension-range attribute
//! means image geometry inside a general-header object but code-block
//! geometry inside a block-header template. The fields the core consumes:
//!
//! - `PIM_DP_IMAGE_TYPE` (0x301D, 0x1004): `WSI` / `LABELIMAGE` / `MACROIMAGE`
//! - `UFS_IMAGE_DIMENSION_SCALE_FACTOR` (0x301D, 0x2007): microns per pixel
//! - `UFS_IMAGE_DIMENSION_RANGE` (0x301D, 0x200B): `start step end` triplets
//!   giving offsets, dimensions, level count and template block geometry
//! - `UFS_IMAGE_BLOCK_HEADER_TABLE` (0x301D, 0x2014): base64-encoded binary
//!   code-block headers

use base64::Engine;

use crate::error::IsyntaxError;

/// Maximum element nesting the scanner accepts.
const MAX_XML_DEPTH: usize = 64;

/// Maximum size of a single attribute/content value (the block header table
/// of a large slide is a few tens of megabytes of base64).
const MAX_VALUE_LEN: usize = 256 * 1024 * 1024;

// DICOM addresses the parser dispatches on
const GROUP_UFS: u16 = 0x301D;
const ELEM_IMAGE_TYPE: u16 = 0x1004;
const ELEM_SCANNED_IMAGES: u16 = 0x1003;
const ELEM_GENERAL_HEADERS: u16 = 0x2000;
const ELEM_DIMENSION_SCALE_FACTOR: u16 = 0x2007;
const ELEM_BLOCK_HEADER_TEMPLATES: u16 = 0x2009;
const ELEM_DIMENSION_RANGE: u16 = 0x200B;
const ELEM_BLOCK_HEADER_TABLE: u16 = 0x2014;

// =============================================================================
// Parsed model
// =============================================================================

/// Kind of image a `DPScannedImage` object describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsyntaxImageType {
    #[default]
    Unknown,
    Wsi,
    Label,
    Macro,
}

/// One scanned image from the header.
#[derive(Debug, Clone, Default)]
pub struct XmlImage {
    pub image_type: IsyntaxImageType,
    /// Grid origin of the image in raw code-block coordinates
    pub offset_x: i32,
    pub offset_y: i32,
    /// Pixel dimensions at full resolution
    pub width: u32,
    pub height: u32,
    /// Number of wavelet scales (levels) in the pyramid
    pub level_count: u32,
    /// Decoded binary block header table
    pub block_header_table: Vec<u8>,
}

/// One block-header template: code-block geometry shared by many blocks.
#[derive(Debug, Clone, Default)]
pub struct BlockHeaderTemplate {
    pub block_width: u32,
    pub block_height: u32,
    pub color_component: u32,
    pub scale: u32,
    /// 1 for an LL template, 3 for an H (HL/LH/HH) template
    pub waveletcoeff: u32,
}

/// Everything the container reader needs from the XML header.
#[derive(Debug, Clone, Default)]
pub struct XmlHeader {
    pub mpp_x: f64,
    pub mpp_y: f64,
    pub images: Vec<XmlImage>,
    pub templates: Vec<BlockHeaderTemplate>,
}

impl XmlHeader {
    /// The WSI image, if the header declares one.
    pub fn wsi(&self) -> Option<&XmlImage> {
        self.images
            .iter()
            .find(|i| i.image_type == IsyntaxImageType::Wsi)
    }

    /// Code-block width/height from the first template.
    pub fn block_dimensions(&self) -> Option<(u32, u32)> {
        self.templates
            .first()
            .map(|t| (t.block_width, t.block_height))
    }
}

// =============================================================================
// Byte scanner
// =============================================================================

struct Scanner<'a> {
    data: &'a [u8],
    pos: usize,
}

/// A start tag with its raw attribute list.
struct StartTag<'a> {
    name: &'a [u8],
    attrs: Vec<(&'a [u8], &'a [u8])>,
    self_closing: bool,
}

enum Token<'a> {
    Start(StartTag<'a>),
    End(&'a [u8]),
    Eof,
}

impl<'a> Scanner<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn err(&self, message: &str) -> IsyntaxError {
        IsyntaxError::MalformedXml(format!("{message} at byte {}", self.pos))
    }

    /// Consume text up to the next `<`, returning it trimmed.
    fn take_text(&mut self) -> &'a [u8] {
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos] != b'<' {
            self.pos += 1;
        }
        trim_ascii(&self.data[start..self.pos])
    }

    /// Read the next tag token, skipping declarations and comments.
    fn next_token(&mut self) -> Result<Token<'a>, IsyntaxError> {
        loop {
            while self.pos < self.data.len() && self.data[self.pos] != b'<' {
                self.pos += 1;
            }
            if self.pos >= self.data.len() {
                return Ok(Token::Eof);
            }
            self.pos += 1; // consume '<'

            match self.data.get(self.pos) {
                Some(b'?') | Some(b'!') => {
                    // Declaration or comment: skip to the closing '>'
                    while self.pos < self.data.len() && self.data[self.pos] != b'>' {
                        self.pos += 1;
                    }
                    self.pos += 1;
                    continue;
                }
                Some(b'/') => {
                    self.pos += 1;
                    let start = self.pos;
                    while self.pos < self.data.len() && self.data[self.pos] != b'>' {
                        self.pos += 1;
                    }
                    let name = trim_ascii(&self.data[start..self.pos]);
                    self.pos += 1;
                    return Ok(Token::End(name));
                }
                Some(_) => return self.read_start_tag().map(Token::Start),
                None => return Err(self.err("unexpected end of document")),
            }
        }
    }

    fn read_start_tag(&mut self) -> Result<StartTag<'a>, IsyntaxError> {
        let start = self.pos;
        while self.pos < self.data.len() && !b" \t\r\n/>".contains(&self.data[self.pos]) {
            self.pos += 1;
        }
        let name = &self.data[start..self.pos];
        if name.is_empty() {
            return Err(self.err("empty element name"));
        }

        let mut attrs = Vec::new();
        let mut self_closing = false;

        loop {
            self.skip_whitespace();
            match self.data.get(self.pos) {
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(b'/') => {
                    self_closing = true;
                    self.pos += 1;
                }
                Some(_) => {
                    let key_start = self.pos;
                    while self.pos < self.data.len()
                        && !b"= \t\r\n/>".contains(&self.data[self.pos])
                    {
                        self.pos += 1;
                    }
                    let key = &self.data[key_start..self.pos];
                    self.skip_whitespace();
                    if self.data.get(self.pos) != Some(&b'=') {
                        return Err(self.err("attribute without value"));
                    }
                    self.pos += 1;
                    self.skip_whitespace();
                    let quote = *self
                        .data
                        .get(self.pos)
                        .ok_or_else(|| self.err("unterminated attribute"))?;
                    if quote != b'"' && quote != b'\'' {
                        return Err(self.err("unquoted attribute value"));
                    }
                    self.pos += 1;
                    let value_start = self.pos;
                    while self.pos < self.data.len() && self.data[self.pos] != quote {
                        self.pos += 1;
                    }
                    if self.pos >= self.data.len() {
                        return Err(self.err("unterminated attribute value"));
                    }
                    let value = &self.data[value_start..self.pos];
                    self.pos += 1;
                    attrs.push((key, value));
                }
                None => return Err(self.err("unterminated start tag")),
            }
        }

        Ok(StartTag {
            name,
            attrs,
            self_closing,
        })
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.data.len() && self.data[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

// =============================================================================
// Header parsing
// =============================================================================

/// Which kind of enclosing attribute a nested object belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrContext {
    ScannedImages,
    GeneralHeaders,
    Templates,
    Other,
}

struct ParseState {
    header: XmlHeader,
    /// Stack of enclosing branch attributes
    contexts: Vec<AttrContext>,
    /// Dimension-range counter inside the current general-header object
    general_dim_index: usize,
    /// Dimension-range counter inside the current template object
    template_dim_index: usize,
    /// Scale-factor counter inside the current image
    scale_dim_index: usize,
}

impl ParseState {
    fn in_context(&self, wanted: AttrContext) -> bool {
        self.contexts.iter().rev().any(|&c| c == wanted)
    }

    fn current_image(&mut self) -> &mut XmlImage {
        if self.header.images.is_empty() {
            self.header.images.push(XmlImage::default());
        }
        self.header.images.last_mut().expect("just pushed")
    }
}

/// Parse the XML header bytes (everything before the `0x04` terminator).
pub fn parse_header(data: &[u8]) -> Result<XmlHeader, IsyntaxError> {
    let mut scanner = Scanner::new(data);
    let mut state = ParseState {
        header: XmlHeader::default(),
        contexts: Vec::new(),
        general_dim_index: 0,
        template_dim_index: 0,
        scale_dim_index: 0,
    };

    match scanner.next_token()? {
        Token::Start(tag) => parse_element(&mut scanner, tag, &mut state, 1)?,
        _ => {
            return Err(IsyntaxError::MalformedXml(
                "document has no root element".to_string(),
            ))
        }
    }

    if state.header.images.is_empty() {
        return Err(IsyntaxError::MalformedXml(
            "header declares no scanned images".to_string(),
        ));
    }

    Ok(state.header)
}

fn parse_element(
    scanner: &mut Scanner<'_>,
    tag: StartTag<'_>,
    state: &mut ParseState,
    depth: usize,
) -> Result<(), IsyntaxError> {
    if depth > MAX_XML_DEPTH {
        return Err(IsyntaxError::XmlTooDeep(scanner.pos as u64));
    }

    let is_data_object = tag.name == b"DataObject";
    let is_attribute = tag.name == b"Attribute";

    if is_data_object {
        on_data_object_start(state);
    }

    if tag.self_closing {
        return Ok(());
    }

    if is_attribute {
        return parse_attribute(scanner, &tag, state, depth);
    }

    // DataObject / Array / root: children only
    loop {
        match scanner.next_token()? {
            Token::Start(child) => parse_element(scanner, child, state, depth + 1)?,
            Token::End(name) => {
                if name != tag.name {
                    return Err(scanner.err("mismatched closing tag"));
                }
                return Ok(());
            }
            Token::Eof => return Err(scanner.err("unexpected end of document")),
        }
    }
}

fn on_data_object_start(state: &mut ParseState) {
    // Only the immediately enclosing attribute decides what a DataObject is:
    // general-header objects are still nested inside the scanned-images
    // attribute and must not start a new image.
    match state.contexts.last() {
        Some(AttrContext::ScannedImages) => {
            state.header.images.push(XmlImage::default());
            state.scale_dim_index = 0;
        }
        Some(AttrContext::GeneralHeaders) => {
            state.general_dim_index = 0;
        }
        Some(AttrContext::Templates) => {
            state.header.templates.push(BlockHeaderTemplate::default());
            state.template_dim_index = 0;
        }
        _ => {}
    }
}

fn parse_attribute(
    scanner: &mut Scanner<'_>,
    tag: &StartTag<'_>,
    state: &mut ParseState,
    depth: usize,
) -> Result<(), IsyntaxError> {
    let mut group = 0u16;
    let mut element = 0u16;
    let mut name = Vec::new();
    for (key, value) in &tag.attrs {
        match *key {
            b"Group" => group = parse_hex_u16(value),
            b"Element" => element = parse_hex_u16(value),
            b"Name" => name = value.to_vec(),
            _ => {}
        }
    }

    // Branch or leaf? Peek: text up to '<', then the next token decides.
    let text = scanner.take_text();
    if text.len() > MAX_VALUE_LEN {
        return Err(IsyntaxError::AttrOverflow {
            element: String::from_utf8_lossy(&name).into_owned(),
        });
    }

    // A branch attribute contains an Array (or DataObject) before its close.
    match scanner.next_token()? {
        Token::End(end_name) => {
            if end_name != b"Attribute" {
                return Err(scanner.err("mismatched closing tag"));
            }
            dispatch_leaf(group, element, text, state)
        }
        Token::Start(child) => {
            let context = classify_context(group, element);
            state.contexts.push(context);
            parse_element(scanner, child, state, depth + 1)?;
            // Consume remaining children up to </Attribute>
            loop {
                match scanner.next_token()? {
                    Token::Start(next) => parse_element(scanner, next, state, depth + 1)?,
                    Token::End(end_name) => {
                        if end_name != b"Attribute" {
                            return Err(scanner.err("mismatched closing tag"));
                        }
                        break;
                    }
                    Token::Eof => return Err(scanner.err("unexpected end of document")),
                }
            }
            state.contexts.pop();
            Ok(())
        }
        Token::Eof => Err(scanner.err("unexpected end of document")),
    }
}

fn classify_context(group: u16, element: u16) -> AttrContext {
    if group != GROUP_UFS {
        return AttrContext::Other;
    }
    match element {
        ELEM_SCANNED_IMAGES => AttrContext::ScannedImages,
        ELEM_GENERAL_HEADERS => AttrContext::GeneralHeaders,
        ELEM_BLOCK_HEADER_TEMPLATES => AttrContext::Templates,
        _ => AttrContext::Other,
    }
}

fn dispatch_leaf(
    group: u16,
    element: u16,
    value: &[u8],
    state: &mut ParseState,
) -> Result<(), IsyntaxError> {
    if group != GROUP_UFS {
        return Ok(());
    }

    match element {
        ELEM_IMAGE_TYPE => {
            let image = state.current_image();
            image.image_type = match value {
                b"WSI" => IsyntaxImageType::Wsi,
                b"LABELIMAGE" => IsyntaxImageType::Label,
                b"MACROIMAGE" => IsyntaxImageType::Macro,
                _ => IsyntaxImageType::Unknown,
            };
        }
        ELEM_DIMENSION_SCALE_FACTOR => {
            let index = state.scale_dim_index;
            state.scale_dim_index += 1;
            let mpp: f64 = std::str::from_utf8(value)
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0.0);
            match index {
                0 => state.header.mpp_x = mpp,
                1 => state.header.mpp_y = mpp,
                _ => {}
            }
        }
        ELEM_DIMENSION_RANGE => {
            let (start, step, end) = parse_three_integers(value);
            let step_nonzero = if step != 0 { step } else { 1 };
            let numsteps = ((end + step) - start) / step_nonzero;

            if state.in_context(AttrContext::Templates) {
                let index = state.template_dim_index;
                state.template_dim_index += 1;
                if let Some(template) = state.header.templates.last_mut() {
                    match index {
                        0 => template.block_width = numsteps as u32,
                        1 => template.block_height = numsteps as u32,
                        2 => template.color_component = start as u32,
                        3 => template.scale = start as u32,
                        4 => template.waveletcoeff = if start == 0 { 1 } else { 3 },
                        _ => {}
                    }
                }
            } else if state.in_context(AttrContext::GeneralHeaders) {
                let index = state.general_dim_index;
                state.general_dim_index += 1;
                let image = state.current_image();
                match index {
                    0 => {
                        image.offset_x = start;
                        image.width = numsteps as u32;
                    }
                    1 => {
                        image.offset_y = start;
                        image.height = numsteps as u32;
                    }
                    2 => {} // colour channels, always Y/Co/Cg
                    3 => image.level_count = numsteps as u32,
                    4 => {} // wavelet coefficients, always LL/LH/HL/HH
                    _ => {}
                }
            }
        }
        ELEM_BLOCK_HEADER_TABLE => {
            let decoded = decode_base64_lenient(value)?;
            state.current_image().block_header_table = decoded;
        }
        _ => {}
    }

    Ok(())
}

/// Decode RFC 4648 base64, tolerating trailing whitespace and the stray
/// trailing `/` some scanners emit.
fn decode_base64_lenient(mut value: &[u8]) -> Result<Vec<u8>, IsyntaxError> {
    value = trim_ascii(value);
    if value.ends_with(b"/") && (value.len() % 4) == 1 {
        value = &value[..value.len() - 1];
    }

    // Strip embedded line breaks before handing to the strict decoder
    let filtered: Vec<u8> = value
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    base64::engine::general_purpose::STANDARD
        .decode(&filtered)
        .map_err(|e| IsyntaxError::BadBase64(e.to_string()))
}

fn parse_hex_u16(value: &[u8]) -> u16 {
    let s = std::str::from_utf8(value).unwrap_or("0");
    let s = s.trim().trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(s, 16).unwrap_or(0)
}

/// Parse a `start step end` triplet, skipping any whitespace between
/// numbers; missing numbers read as zero.
fn parse_three_integers(value: &[u8]) -> (i32, i32, i32) {
    let text = String::from_utf8_lossy(value);
    let mut numbers = text
        .split_whitespace()
        .map(|w| w.parse::<i32>().unwrap_or(0));
    (
        numbers.next().unwrap_or(0),
        numbers.next().unwrap_or(0),
        numbers.next().unwrap_or(0),
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    fn attribute(name: &str, group: u16, element: u16, value: &str) -> String {
        format!(
            r#"<Attribute Name="{name}" Group="0x{group:04X}" Element="0x{element:04X}" PMSVR="IString">{value}</Attribute>"#
        )
    }

    fn dimension_object(ranges: &str) -> String {
        format!(r#"<DataObject ObjectType="UFSImageGeneralHeader">{ranges}</DataObject>"#)
    }

    fn minimal_header(block_table_b64: &str) -> String {
        let general = dimension_object(&[
            attribute("UFS_IMAGE_DIMENSION_RANGE", 0x301D, 0x200B, "0 1 99999"),
            attribute("UFS_IMAGE_DIMENSION_RANGE", 0x301D, 0x200B, "0 1 59999"),
            attribute("UFS_IMAGE_DIMENSION_RANGE", 0x301D, 0x200B, "0 1 2"),
            attribute("UFS_IMAGE_DIMENSION_RANGE", 0x301D, 0x200B, "0 1 8"),
            attribute("UFS_IMAGE_DIMENSION_RANGE", 0x301D, 0x200B, "0 1 3"),
        ]
        .join(""));

        let template = format!(
            r#"<DataObject ObjectType="UFSImageBlockHeaderTemplate">{}{}</DataObject>"#,
            attribute("UFS_IMAGE_DIMENSION_RANGE", 0x301D, 0x200B, "0 1 127"),
            attribute("UFS_IMAGE_DIMENSION_RANGE", 0x301D, 0x200B, "0 1 127"),
        );

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<DataObject ObjectType="DPUfsImport">
  <Attribute Name="PIM_DP_SCANNED_IMAGES" Group="0x301D" Element="0x1003" PMSVR="IDataObjectArray">
    <Array>
      <DataObject ObjectType="DPScannedImage">
        {image_type}
        {scale_x}
        {scale_y}
        <Attribute Name="UFS_IMAGE_GENERAL_HEADERS" Group="0x301D" Element="0x2000" PMSVR="IDataObjectArray">
          <Array>{general}</Array>
        </Attribute>
        <Attribute Name="UFS_IMAGE_BLOCK_HEADER_TEMPLATES" Group="0x301D" Element="0x2009" PMSVR="IDataObjectArray">
          <Array>{template}</Array>
        </Attribute>
        {table}
      </DataObject>
    </Array>
  </Attribute>
</DataObject>"#,
            image_type = attribute("PIM_DP_IMAGE_TYPE", 0x301D, 0x1004, "WSI"),
            scale_x = attribute("UFS_IMAGE_DIMENSION_SCALE_FACTOR", 0x301D, 0x2007, "0.25"),
            scale_y = attribute("UFS_IMAGE_DIMENSION_SCALE_FACTOR", 0x301D, 0x2007, "0.25"),
            general = general,
            template = template,
            table = attribute("UFS_IMAGE_BLOCK_HEADER_TABLE", 0x301D, 0x2014, block_table_b64),
        )
    }

    #[test]
    fn test_parse_minimal_wsi_header() {
        let table = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3, 4]);
        let xml = minimal_header(&table);

        let header = parse_header(xml.as_bytes()).unwrap();

        assert_eq!(header.mpp_x, 0.25);
        assert_eq!(header.mpp_y, 0.25);

        let wsi = header.wsi().unwrap();
        assert_eq!(wsi.width, 100_000);
        assert_eq!(wsi.height, 60_000);
        assert_eq!(wsi.level_count, 9);
        assert_eq!(wsi.block_header_table, vec![1, 2, 3, 4]);

        assert_eq!(header.block_dimensions(), Some((128, 128)));
    }

    #[test]
    fn test_image_type_classification() {
        let table = base64::engine::general_purpose::STANDARD.encode([0u8; 4]);
        let xml = minimal_header(&table).replace(">WSI<", ">MACROIMAGE<");

        let header = parse_header(xml.as_bytes()).unwrap();
        assert!(header.wsi().is_none());
        assert_eq!(header.images[0].image_type, IsyntaxImageType::Macro);
    }

    #[test]
    fn test_dimension_range_numsteps() {
        // "0 1 8" -> numsteps = ((8 + 1) - 0) / 1 = 9 levels
        assert_eq!(parse_three_integers(b"0 1 8"), (0, 1, 8));
        // With step 2: "10 2 20" -> ((20 + 2) - 10) / 2 = 6
        let (start, step, end) = parse_three_integers(b"10 2 20");
        assert_eq!(((end + step) - start) / step, 6);
    }

    #[test]
    fn test_base64_with_trailing_slash() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([9u8, 8, 7]);
        let with_junk = format!("{encoded}/");
        let decoded = decode_base64_lenient(with_junk.as_bytes()).unwrap();
        assert_eq!(decoded, vec![9, 8, 7]);
    }

    #[test]
    fn test_bad_base64_is_error() {
        let result = decode_base64_lenient(b"!!!not base64!!!");
        assert!(matches!(result, Err(IsyntaxError::BadBase64(_))));
    }

    #[test]
    fn test_no_images_is_error() {
        let xml = r#"<DataObject ObjectType="DPUfsImport"></DataObject>"#;
        let result = parse_header(xml.as_bytes());
        assert!(matches!(result, Err(IsyntaxError::MalformedXml(_))));
    }

    #[test]
    fn test_depth_guard() {
        let mut xml = String::new();
        for _ in 0..80 {
            xml.push_str("<Array>");
        }
        for _ in 0..80 {
            xml.push_str("</Array>");
        }
        let result = parse_header(xml.as_bytes());
        assert!(matches!(result, Err(IsyntaxError::XmlTooDeep(_))));
    }

    #[test]
    fn test_mismatched_tags_rejected() {
        let xml = r#"<DataObject><Array></DataObject></Array>"#;
        let result = parse_header(xml.as_bytes());
        assert!(matches!(result, Err(IsyntaxError::MalformedXml(_))));
    }

    #[test]
    fn test_hex_attribute_values() {
        assert_eq!(parse_hex_u16(b"0x301D"), 0x301D);
        assert_eq!(parse_hex_u16(b"301D"), 0x301D);
        assert_eq!(parse_hex_u16(b"0x2014"), 0x2014);
    }
}
