//! Response parsing.
//!
//! Elements are matched on their local name only. WinRM responses are small,
//! flat documents, which keeps a scanner sufficient here.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use serde::Serialize;

use super::RemoteCommandState;
use crate::error::{Result, WinRmError};

// ============================================================================
// Element scanner
// ============================================================================

/// A located element: qualified name, raw attribute text and raw content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Element<'a> {
    name: &'a str,
    attrs: &'a str,
    inner: &'a str,
}

impl<'a> Element<'a> {
    pub(crate) fn local_name(&self) -> &'a str {
        local_name(self.name)
    }

    /// Attribute value by local name, unescaped.
    pub(crate) fn attr(&self, want: &str) -> Option<String> {
        let mut rest = self.attrs;
        loop {
            rest = rest.trim_start();
            let eq = rest.find('=')?;
            let key = rest[..eq].trim();
            let after = rest[eq + 1..].trim_start();
            let quote = after.chars().next().filter(|c| *c == '"' || *c == '\'')?;
            let len = after[1..].find(quote)?;
            if local_name(key) == want {
                return Some(xml_unescape(&after[1..1 + len]));
            }
            rest = &after[len + 2..];
        }
    }

    /// Unescaped text content.
    pub(crate) fn text(&self) -> String {
        xml_unescape(self.inner)
    }

    /// Whether the element has no content at all.
    pub(crate) fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// First descendant with the given local name.
    pub(crate) fn find(&self, local: &str) -> Option<Element<'a>> {
        find(self.inner, local)
    }

    /// Direct child elements in document order.
    pub(crate) fn children(&self) -> Vec<Element<'a>> {
        let mut out = Vec::new();
        let mut pos = 0;
        while let Some((element, next)) = next_element(self.inner, None, pos) {
            out.push(element);
            pos = next;
        }
        out
    }
}

fn local_name(qname: &str) -> &str {
    qname.rsplit(':').next().unwrap_or(qname)
}

/// First element named `local` anywhere in `xml`.
pub(crate) fn find<'a>(xml: &'a str, local: &str) -> Option<Element<'a>> {
    next_element(xml, Some(local), 0).map(|(e, _)| e)
}

/// All non-nested elements named `local` in `xml`.
pub(crate) fn find_all<'a>(xml: &'a str, local: &str) -> Vec<Element<'a>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while let Some((element, next)) = next_element(xml, Some(local), pos) {
        out.push(element);
        pos = next;
    }
    out
}

/// Next element starting at or after `pos`, optionally filtered by local
/// name, plus the offset just past its end.
fn next_element<'a>(xml: &'a str, local: Option<&str>, mut pos: usize) -> Option<(Element<'a>, usize)> {
    while let Some(rel) = xml.get(pos..)?.find('<') {
        let start = pos + rel;
        let rest = &xml[start + 1..];
        if rest.starts_with(|c: char| matches!(c, '/' | '?' | '!')) {
            pos = start + 1;
            continue;
        }

        let name_len = rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(rest.len());
        let name = &rest[..name_len];
        if local.is_some_and(|want| local_name(name) != want) {
            pos = start + 1;
            continue;
        }

        let tag_len = rest.find('>')?;
        let tag = &rest[..tag_len];
        let content_start = start + 1 + tag_len + 1;

        if tag.ends_with('/') {
            let attrs = tag.get(name_len..tag_len - 1).unwrap_or("").trim();
            return Some((
                Element {
                    name,
                    attrs,
                    inner: "",
                },
                content_start,
            ));
        }

        let attrs = tag[name_len..].trim();
        let (inner_end, after) = matching_close(xml, name, content_start)?;
        return Some((
            Element {
                name,
                attrs,
                inner: &xml[content_start..inner_end],
            },
            after,
        ));
    }
    None
}

/// Offset of the `</name>` closing the element whose content starts at
/// `from`, accounting for nested elements of the same name.
fn matching_close(xml: &str, name: &str, from: usize) -> Option<(usize, usize)> {
    let open = format!("<{name}");
    let close = format!("</{name}>");
    let mut depth = 1usize;
    let mut pos = from;

    loop {
        let close_at = pos + xml.get(pos..)?.find(&close)?;

        let mut scan = pos;
        while let Some(rel) = xml[scan..close_at].find(&open) {
            let at = scan + rel;
            let after = &xml[at + open.len()..];
            let boundary = after.starts_with(|c: char| c.is_whitespace() || c == '>');
            if boundary {
                let self_closing = after
                    .find('>')
                    .is_some_and(|gt| after[..gt].ends_with('/'));
                if !self_closing {
                    depth += 1;
                }
            }
            scan = at + open.len();
        }

        depth -= 1;
        if depth == 0 {
            return Some((close_at, close_at + close.len()));
        }
        pos = close_at + close.len();
    }
}

/// Decode the five predefined entities and numeric character references.
pub(crate) fn xml_unescape(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp..];
        let Some(semi) = tail.find(';') else {
            out.push_str(tail);
            return out;
        };
        let entity = &tail[1..semi];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[semi + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

// ============================================================================
// Faults
// ============================================================================

/// SOAP fault carried by `xml`, if any.
pub fn parse_fault(xml: &str) -> Option<WinRmError> {
    let fault = find(xml, "Fault")?;

    let code = fault
        .find("Code")
        .and_then(|c| c.find("Value"))
        .map(|v| v.text().trim().to_string());
    let wsman = fault.find("WSManFault");
    let wsman_code = wsman.and_then(|w| w.attr("Code"));
    let reason = fault
        .find("Reason")
        .and_then(|r| r.find("Text"))
        .map(|t| t.text().trim().to_string())
        .or_else(|| {
            wsman
                .and_then(|w| w.find("Message"))
                .map(|m| m.text().trim().to_string())
        })
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "Unknown SOAP fault".to_string());

    Some(WinRmError::SoapFault {
        code,
        reason,
        wsman_code,
    })
}

// ============================================================================
// Shell responses
// ============================================================================

/// Shell id from a Create response.
pub fn parse_shell_id(xml: &str) -> Result<String> {
    let from_shell = find(xml, "Shell")
        .and_then(|shell| shell.find("ShellId"))
        .map(|e| e.text().trim().to_string());
    let from_selector = || {
        find_all(xml, "Selector")
            .into_iter()
            .find(|s| s.attr("Name").as_deref() == Some("ShellId"))
            .map(|s| s.text().trim().to_string())
    };

    from_shell
        .or_else(from_selector)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| WinRmError::Protocol("Create response missing ShellId".into()))
}

/// Command id from a Command response.
pub fn parse_command_id(xml: &str) -> Result<String> {
    find(xml, "CommandId")
        .map(|e| e.text().trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| WinRmError::Protocol("Command response missing CommandId".into()))
}

/// Output and state carried by one Receive response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveChunk {
    /// Decoded stdout bytes
    pub stdout: Vec<u8>,
    /// Decoded stderr bytes
    pub stderr: Vec<u8>,
    /// Server marked the end of stdout
    pub stdout_end: bool,
    /// Server marked the end of stderr
    pub stderr_end: bool,
    /// Reported command state
    pub state: Option<RemoteCommandState>,
    /// Exit code, present once the command is done
    pub exit_code: Option<i32>,
}

impl ReceiveChunk {
    /// Whether the command has finished.
    pub fn is_done(&self) -> bool {
        self.state == Some(RemoteCommandState::Done)
    }
}

/// Decode a Receive response.
pub fn parse_receive(xml: &str) -> Result<ReceiveChunk> {
    let response = find(xml, "ReceiveResponse")
        .ok_or_else(|| WinRmError::Protocol("Receive response missing ReceiveResponse".into()))?;

    let mut chunk = ReceiveChunk::default();
    for stream in find_all(response.inner, "Stream") {
        let end = stream.attr("End").as_deref() == Some("true");
        let data = stream.text();
        let data = data.trim();
        let bytes = if data.is_empty() {
            Vec::new()
        } else {
            BASE64_STANDARD
                .decode(data)
                .map_err(|e| WinRmError::Protocol(format!("invalid stream encoding: {e}")))?
        };

        match stream.attr("Name").as_deref() {
            Some("stdout") => {
                chunk.stdout.extend_from_slice(&bytes);
                chunk.stdout_end |= end;
            }
            Some("stderr") => {
                chunk.stderr.extend_from_slice(&bytes);
                chunk.stderr_end |= end;
            }
            other => {
                return Err(WinRmError::Protocol(format!(
                    "unexpected output stream {other:?}"
                )))
            }
        }
    }

    if let Some(state) = response.find("CommandState") {
        chunk.state = state.attr("State").as_deref().and_then(RemoteCommandState::from_uri);
        chunk.exit_code = state
            .find("ExitCode")
            .map(|e| {
                e.text()
                    .trim()
                    .parse::<i64>()
                    .map(|code| code as i32)
                    .map_err(|_| WinRmError::Protocol(format!("invalid exit code {:?}", e.text())))
            })
            .transpose()?;
    }

    Ok(chunk)
}

// ============================================================================
// Identify
// ============================================================================

/// Result of a WS-Man Identify.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdentifyResponse {
    /// WS-Management protocol namespace
    pub protocol_version: String,
    /// Vendor, e.g. `Microsoft Corporation`
    pub product_vendor: String,
    /// Version string, e.g. `OS: 10.0.17763 SP: 0.0 Stack: 3.0`
    pub product_version: String,
    /// Advertised security profiles
    pub security_profiles: Vec<String>,
}

/// Decode an Identify response.
pub fn parse_identify(xml: &str) -> Result<IdentifyResponse> {
    let response = find(xml, "IdentifyResponse")
        .ok_or_else(|| WinRmError::Protocol("Identify response missing IdentifyResponse".into()))?;
    let field = |name: &str| {
        response
            .find(name)
            .map(|e| e.text().trim().to_string())
            .unwrap_or_default()
    };

    let security_profiles = response
        .find("SecurityProfiles")
        .map(|profiles| {
            find_all(profiles.inner, "SecurityProfileName")
                .into_iter()
                .map(|p| p.text().trim().to_string())
                .collect()
        })
        .unwrap_or_default();

    Ok(IdentifyResponse {
        protocol_version: field("ProtocolVersion"),
        product_vendor: field("ProductVendor"),
        product_version: field("ProductVersion"),
        security_profiles,
    })
}

// ============================================================================
// CIM objects
// ============================================================================

/// A CIM property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CimValue {
    /// `xsi:nil` or empty
    Null,
    /// `true` / `false`
    Bool(bool),
    /// Integer literal
    Int(i64),
    /// Anything else
    Text(String),
    /// Repeated property
    List(Vec<CimValue>),
}

impl CimValue {
    /// Coerce element text the way WMI values are usually meant.
    pub fn coerce(text: Option<&str>) -> Self {
        match text {
            None => CimValue::Null,
            Some("true") => CimValue::Bool(true),
            Some("false") => CimValue::Bool(false),
            Some(t) => t
                .trim()
                .parse::<i64>()
                .map(CimValue::Int)
                .unwrap_or_else(|_| CimValue::Text(t.to_string())),
        }
    }

    /// Text content, if this is a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            CimValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if this is an integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CimValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean content, if this is a boolean value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            CimValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Properties of one CIM instance.
pub type CimObject = BTreeMap<String, CimValue>;

/// Decode a WS-Transfer Get response for a CIM instance.
pub fn parse_cim_object(xml: &str) -> Result<CimObject> {
    let body = find(xml, "Body")
        .ok_or_else(|| WinRmError::Protocol("SOAP envelope missing Body".into()))?;
    let instance = body
        .children()
        .into_iter()
        .next()
        .ok_or_else(|| WinRmError::Protocol("Get response missing instance data".into()))?;

    Ok(instance_properties(&instance))
}

/// Properties of one instance element; repeated properties become lists.
fn instance_properties(instance: &Element<'_>) -> CimObject {
    let mut object = CimObject::new();
    for property in instance.children() {
        let value = if property.attr("nil").as_deref() == Some("true") || property.is_empty() {
            CimValue::Null
        } else {
            CimValue::coerce(Some(&property.text()))
        };

        let name = property.local_name().to_string();
        match object.remove(&name) {
            None => {
                object.insert(name, value);
            }
            Some(CimValue::List(mut values)) => {
                values.push(value);
                object.insert(name, CimValue::List(values));
            }
            Some(previous) => {
                object.insert(name, CimValue::List(vec![previous, value]));
            }
        }
    }
    object
}

/// Output parameters of a WMI method, with their text kept as sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MethodOutput {
    params: BTreeMap<String, Vec<Option<String>>>,
}

impl MethodOutput {
    /// `ReturnValue`, if present and numeric.
    pub fn return_value(&self) -> Option<i64> {
        self.text("ReturnValue")?.trim().parse().ok()
    }

    /// First value of `name`; `None` when missing or nil.
    pub fn text(&self, name: &str) -> Option<&str> {
        self.params.get(name)?.first()?.as_deref()
    }

    /// Every non-nil value of an array parameter.
    pub fn texts(&self, name: &str) -> Vec<&str> {
        self.params
            .get(name)
            .map(|values| values.iter().filter_map(|v| v.as_deref()).collect())
            .unwrap_or_default()
    }

    /// Whether `name` was returned at all.
    pub fn contains(&self, name: &str) -> bool {
        self.params.contains_key(name)
    }
}

/// Decode the `<{method}_OUTPUT>` element of an Invoke response.
pub fn parse_method_output(xml: &str, method: &str) -> Result<MethodOutput> {
    let element = format!("{method}_OUTPUT");
    let output = find(xml, &element)
        .ok_or_else(|| WinRmError::Protocol(format!("Invoke response missing {element}")))?;

    let mut params: BTreeMap<String, Vec<Option<String>>> = BTreeMap::new();
    for param in output.children() {
        let value = (param.attr("nil").as_deref() != Some("true")).then(|| param.text());
        params
            .entry(param.local_name().to_string())
            .or_default()
            .push(value);
    }
    Ok(MethodOutput { params })
}

// ============================================================================
// Enumeration
// ============================================================================

/// One Enumerate or Pull response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumerationBatch {
    /// Context for the next Pull, absent once the server is done
    pub context: Option<String>,
    /// Instances in this batch
    pub items: Vec<CimObject>,
    /// The server has no more items
    pub end_of_sequence: bool,
}

/// Decode an `EnumerateResponse` or `PullResponse`.
pub fn parse_enumeration(xml: &str) -> Result<EnumerationBatch> {
    let response = find(xml, "EnumerateResponse")
        .or_else(|| find(xml, "PullResponse"))
        .ok_or_else(|| WinRmError::Protocol("missing EnumerateResponse or PullResponse".into()))?;

    let context = response
        .find("EnumerationContext")
        .map(|c| c.text().trim().to_string())
        .filter(|c| !c.is_empty());
    let items = response
        .find("Items")
        .map(|items| items.children().iter().map(instance_properties).collect())
        .unwrap_or_default();
    let end_of_sequence = response.find("EndOfSequence").is_some();

    if context.is_none() && !end_of_sequence {
        return Err(WinRmError::Protocol(
            "enumeration response has neither a context nor EndOfSequence".into(),
        ));
    }

    Ok(EnumerationBatch {
        context,
        items,
        end_of_sequence,
    })
}
