//! `Signature-Input` and `Signature` field parsing.
//!
//! Both headers are [RFC 8941](https://www.rfc-editor.org/rfc/rfc8941.html)
//! dictionaries keyed by signature label:
//!
//! ```text
//! Signature-Input: sig1=("@method" "@authority" "@path");created=1700000000;keyid="k1";alg="ecdsa-p256-sha256"
//! Signature: sig1=:MEUCIQDk...:
//! ```
//!
//! This module tokenizes them properly (quoted strings, multiple members,
//! parameters) instead of splitting on delimiters.

use base64::{Engine, engine::general_purpose::STANDARD};

use crate::error::{BotchaError, Result};

/// A bare item from a structured field.
#[derive(Debug, Clone, PartialEq)]
pub enum BareItem {
    /// `42`
    Integer(i64),
    /// `1.5`
    Decimal(f64),
    /// `"text"`
    String(String),
    /// `token`
    Token(String),
    /// `:base64:`
    ByteSequence(Vec<u8>),
    /// `?1` / `?0`
    Boolean(bool),
}

type Parameters = Vec<(String, BareItem)>;

#[derive(Debug, Clone, PartialEq)]
enum MemberValue {
    Item(BareItem),
    InnerList(Vec<(BareItem, Parameters)>),
}

#[derive(Debug, Clone, PartialEq)]
struct Member {
    key: String,
    value: MemberValue,
    params: Parameters,
    raw_value: String,
}

/// One signature's metadata from `Signature-Input`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureInput {
    /// Dictionary key, e.g. `sig1`.
    pub label: String,
    /// Covered components in signing order.
    pub components: Vec<String>,
    /// `keyid` parameter.
    pub key_id: String,
    /// `alg` parameter.
    pub algorithm: Option<String>,
    /// `created` parameter, Unix seconds.
    pub created: Option<u64>,
    /// `expires` parameter, Unix seconds.
    pub expires: Option<u64>,
    /// `nonce` parameter.
    pub nonce: Option<String>,
    /// `tag` parameter.
    pub tag: Option<String>,
    /// The member value exactly as sent, used verbatim for `@signature-params`.
    pub raw_params: String,
}

/// Parses every member of a `Signature-Input` header.
///
/// # Errors
///
/// Returns [`BotchaError::InvalidSignatureInput`] if the field is not a
/// dictionary of inner lists, a component is not a string, or a member has
/// no `keyid`.
///
/// # Examples
///
/// ```
/// use botcha::tap::parse_signature_input;
///
/// let inputs = parse_signature_input(
///     r#"sig1=("@method" "@path");created=1700000000;keyid="k1";alg="ecdsa-p256-sha256""#,
/// )
/// .unwrap();
///
/// assert_eq!(inputs[0].label, "sig1");
/// assert_eq!(inputs[0].components, ["@method", "@path"]);
/// assert_eq!(inputs[0].key_id, "k1");
/// assert_eq!(
///     inputs[0].raw_params,
///     r#"("@method" "@path");created=1700000000;keyid="k1";alg="ecdsa-p256-sha256""#
/// );
/// ```
pub fn parse_signature_input(value: &str) -> Result<Vec<SignatureInput>> {
    let members = Parser::new(value).parse_dictionary()?;
    if members.is_empty() {
        return Err(invalid("empty Signature-Input"));
    }
    members.into_iter().map(signature_input_from_member).collect()
}

/// Picks the `Signature-Input` member for `label`, or the first one if no label is given.
///
/// # Errors
///
/// Same as [`parse_signature_input`], plus a missing label.
pub fn select_signature_input(value: &str, label: Option<&str>) -> Result<SignatureInput> {
    let mut inputs = parse_signature_input(value)?;
    match label {
        None => Ok(inputs.swap_remove(0)),
        Some(label) => inputs
            .into_iter()
            .find(|i| i.label == label)
            .ok_or_else(|| invalid(&format!("no Signature-Input member labelled {label}"))),
    }
}

/// Extracts the signature bytes for `label` from a `Signature` header.
///
/// # Errors
///
/// Returns [`BotchaError::InvalidSignatureInput`] if the field is malformed or
/// has no byte sequence for `label`.
///
/// # Examples
///
/// ```
/// use botcha::tap::parse_signature;
///
/// let bytes = parse_signature("sig1=:AQID:", "sig1").unwrap();
/// assert_eq!(bytes, [1, 2, 3]);
/// ```
pub fn parse_signature(value: &str, label: &str) -> Result<Vec<u8>> {
    dictionary_bytes(value, label)
}

/// Byte-sequence member `key` of any structured dictionary field
/// (`Signature`, `Content-Digest`).
pub(crate) fn dictionary_bytes(value: &str, key: &str) -> Result<Vec<u8>> {
    let members = Parser::new(value).parse_dictionary()?;
    let member = members
        .into_iter()
        .find(|m| m.key == key)
        .ok_or_else(|| invalid(&format!("no member labelled {key}")))?;

    match member.value {
        MemberValue::Item(BareItem::ByteSequence(bytes)) => Ok(bytes),
        _ => Err(invalid(&format!("member {key} is not a byte sequence"))),
    }
}

fn signature_input_from_member(member: Member) -> Result<SignatureInput> {
    let MemberValue::InnerList(items) = member.value else {
        return Err(invalid(&format!("member {} is not an inner list", member.key)));
    };

    let components = items
        .into_iter()
        .map(|(item, params)| match item {
            BareItem::String(name) if params.is_empty() => Ok(name.to_ascii_lowercase()),
            BareItem::String(name) => {
                Err(invalid(&format!("parameters on component {name} are not supported")))
            }
            other => Err(invalid(&format!("component is not a string: {other:?}"))),
        })
        .collect::<Result<Vec<_>>>()?;

    let mut input = SignatureInput {
        label: member.key,
        components,
        key_id: String::new(),
        algorithm: None,
        created: None,
        expires: None,
        nonce: None,
        tag: None,
        raw_params: member.raw_value,
    };

    for (name, value) in member.params {
        match (name.as_str(), value) {
            ("keyid", BareItem::String(v)) => input.key_id = v,
            ("alg", BareItem::String(v)) => input.algorithm = Some(v),
            ("nonce", BareItem::String(v)) => input.nonce = Some(v),
            ("tag", BareItem::String(v)) => input.tag = Some(v),
            ("created", BareItem::Integer(v)) => input.created = Some(non_negative(v, "created")?),
            ("expires", BareItem::Integer(v)) => input.expires = Some(non_negative(v, "expires")?),
            ("keyid" | "alg" | "nonce" | "tag" | "created" | "expires", v) => {
                return Err(invalid(&format!("parameter {name} has wrong type: {v:?}")));
            }
            _ => {}
        }
    }

    if input.key_id.is_empty() {
        return Err(invalid("missing keyid parameter"));
    }
    Ok(input)
}

fn non_negative(v: i64, name: &str) -> Result<u64> {
    u64::try_from(v).map_err(|_| invalid(&format!("{name} must be non-negative")))
}

fn invalid(reason: &str) -> BotchaError {
    BotchaError::InvalidSignatureInput(reason.to_owned())
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input: input.trim_matches(|c| c == ' ' || c == '\t'), pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_sp(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn skip_ows(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    fn parse_dictionary(mut self) -> Result<Vec<Member>> {
        let mut members: Vec<Member> = Vec::new();

        while self.peek().is_some() {
            let key = self.parse_key()?;
            let (value, raw_start) = if self.eat(b'=') {
                let raw_start = self.pos;
                let value = if self.peek() == Some(b'(') {
                    MemberValue::InnerList(self.parse_inner_list()?)
                } else {
                    MemberValue::Item(self.parse_bare_item()?)
                };
                (value, raw_start)
            } else {
                (MemberValue::Item(BareItem::Boolean(true)), self.pos)
            };
            let params = self.parse_parameters()?;
            let raw_value = self.input[raw_start..self.pos].to_owned();

            // later duplicates win
            members.retain(|m| m.key != key);
            members.push(Member { key, value, params, raw_value });
            self.end_of_member()?;
        }

        Ok(members)
    }

    fn end_of_member(&mut self) -> Result<()> {
        self.skip_ows();
        if self.peek().is_none() {
            return Ok(());
        }
        if !self.eat(b',') {
            return Err(invalid(&format!("expected ',' at offset {}", self.pos)));
        }
        self.skip_ows();
        if self.peek().is_none() {
            return Err(invalid("trailing comma"));
        }
        Ok(())
    }

    fn parse_key(&mut self) -> Result<String> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_ascii_lowercase() || c == b'*' => self.pos += 1,
            _ => return Err(invalid(&format!("expected key at offset {start}"))),
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_lowercase()
                || c.is_ascii_digit()
                || matches!(c, b'_' | b'-' | b'.' | b'*')
            {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(self.input[start..self.pos].to_owned())
    }

    fn parse_inner_list(&mut self) -> Result<Vec<(BareItem, Parameters)>> {
        if !self.eat(b'(') {
            return Err(invalid("expected '('"));
        }
        let mut items = Vec::new();
        loop {
            self.skip_sp();
            if self.eat(b')') {
                return Ok(items);
            }
            let item = self.parse_bare_item()?;
            let params = self.parse_parameters()?;
            items.push((item, params));
            match self.peek() {
                Some(b' ' | b')') => {}
                _ => return Err(invalid("unterminated inner list")),
            }
        }
    }

    fn parse_parameters(&mut self) -> Result<Parameters> {
        let mut params: Parameters = Vec::new();
        while self.eat(b';') {
            self.skip_sp();
            let key = self.parse_key()?;
            let value =
                if self.eat(b'=') { self.parse_bare_item()? } else { BareItem::Boolean(true) };
            params.retain(|(k, _)| *k != key);
            params.push((key, value));
        }
        Ok(params)
    }

    fn parse_bare_item(&mut self) -> Result<BareItem> {
        match self.peek() {
            Some(b'"') => self.parse_string(),
            Some(b':') => self.parse_byte_sequence(),
            Some(b'?') => self.parse_boolean(),
            Some(c) if c == b'-' || c.is_ascii_digit() => self.parse_number(),
            Some(c) if c.is_ascii_alphabetic() || c == b'*' => Ok(self.parse_token()),
            _ => Err(invalid(&format!("unexpected character at offset {}", self.pos))),
        }
    }

    fn parse_string(&mut self) -> Result<BareItem> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(invalid("unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(BareItem::String(out));
                }
                Some(b'\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c @ (b'"' | b'\\')) => {
                            out.push(char::from(c));
                            self.pos += 1;
                        }
                        _ => return Err(invalid("bad escape in string")),
                    }
                }
                Some(c) if (0x20..0x7f).contains(&c) => {
                    out.push(char::from(c));
                    self.pos += 1;
                }
                Some(_) => return Err(invalid("non-printable character in string")),
            }
        }
    }

    fn parse_byte_sequence(&mut self) -> Result<BareItem> {
        self.pos += 1;
        let start = self.pos;
        let end = self.input[start..]
            .find(':')
            .map(|offset| start + offset)
            .ok_or_else(|| invalid("unterminated byte sequence"))?;
        let encoded = &self.input[start..end];
        if !encoded.bytes().all(|c| c.is_ascii_alphanumeric() || matches!(c, b'+' | b'/' | b'=')) {
            return Err(invalid("byte sequence is not base64"));
        }
        let bytes = STANDARD
            .decode(encoded)
            .map_err(|e| invalid(&format!("byte sequence is not base64: {e}")))?;
        self.pos = end + 1;
        Ok(BareItem::ByteSequence(bytes))
    }

    fn parse_boolean(&mut self) -> Result<BareItem> {
        self.pos += 1;
        if self.eat(b'1') {
            Ok(BareItem::Boolean(true))
        } else if self.eat(b'0') {
            Ok(BareItem::Boolean(false))
        } else {
            Err(invalid("bad boolean"))
        }
    }

    fn parse_number(&mut self) -> Result<BareItem> {
        let start = self.pos;
        self.eat(b'-');
        let mut is_decimal = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else if c == b'.' && !is_decimal {
                is_decimal = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let text = &self.input[start..self.pos];
        if is_decimal {
            text.parse().map(BareItem::Decimal).map_err(|_| invalid(&format!("bad decimal {text}")))
        } else {
            if text.trim_start_matches('-').len() > 15 {
                return Err(invalid("integer too long"));
            }
            text.parse().map(BareItem::Integer).map_err(|_| invalid(&format!("bad integer {text}")))
        }
    }

    fn parse_token(&mut self) -> BareItem {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~:/".contains(&c) {
                self.pos += 1;
            } else {
                break;
            }
        }
        BareItem::Token(self.input[start..self.pos].to_owned())
    }
}
