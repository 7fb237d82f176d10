//! Request envelopes.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use uuid::Uuid;

use super::{
    Signal, ANONYMOUS, NS_ADDRESSING, NS_ENUMERATION, NS_IDENTITY, NS_SHELL, NS_SOAP, NS_WSMAN,
    NS_WSMAN_MS,
};
use crate::session::ShellOptions;

/// Header fields of one WS-Management request.
#[derive(Debug, Clone)]
pub struct WsManRequest<'a> {
    to: &'a str,
    action: &'a str,
    resource_uri: &'a str,
    selectors: Vec<(&'static str, String)>,
    options: Vec<(&'static str, String)>,
    locale: Option<&'a str>,
    operation_timeout: Option<Duration>,
    max_envelope_size: Option<u32>,
    message_id: Uuid,
}

impl<'a> WsManRequest<'a> {
    /// Request `action` on `resource_uri` at endpoint `to`.
    pub fn new(to: &'a str, action: &'a str, resource_uri: &'a str) -> Self {
        Self {
            to,
            action,
            resource_uri,
            selectors: Vec::new(),
            options: Vec::new(),
            locale: None,
            operation_timeout: None,
            max_envelope_size: None,
            message_id: Uuid::new_v4(),
        }
    }

    /// Add a selector (e.g. `ShellId`).
    pub fn selector(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.selectors.push((name, value.into()));
        self
    }

    /// Add an option (e.g. `WINRS_NOPROFILE`).
    pub fn option(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.options.push((name, value.into()));
        self
    }

    /// Set `Locale` and `DataLocale`.
    pub fn locale(mut self, locale: &'a str) -> Self {
        self.locale = Some(locale);
        self
    }

    /// Set the server-side operation timeout.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Set the largest response envelope the client accepts.
    pub fn max_envelope_size(mut self, size: u32) -> Self {
        self.max_envelope_size = Some(size);
        self
    }

    /// Message id sent in the header.
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Render the envelope around `body`.
    pub fn build(&self, body: &str) -> String {
        let mut header = String::with_capacity(1024);
        header.push_str(&format!("<a:To>{}</a:To>", xml_escape(self.to)));
        header.push_str(&format!(
            r#"<a:ReplyTo><a:Address s:mustUnderstand="true">{ANONYMOUS}</a:Address></a:ReplyTo>"#
        ));
        header.push_str(&format!(
            r#"<a:Action s:mustUnderstand="true">{}</a:Action>"#,
            self.action
        ));
        header.push_str(&format!("<a:MessageID>urn:uuid:{}</a:MessageID>", self.message_id));
        header.push_str(&format!(
            r#"<w:ResourceURI s:mustUnderstand="true">{}</w:ResourceURI>"#,
            self.resource_uri
        ));

        if !self.selectors.is_empty() {
            header.push_str("<w:SelectorSet>");
            for (name, value) in &self.selectors {
                header.push_str(&format!(
                    r#"<w:Selector Name="{name}">{}</w:Selector>"#,
                    xml_escape(value)
                ));
            }
            header.push_str("</w:SelectorSet>");
        }

        if !self.options.is_empty() {
            header.push_str(r#"<w:OptionSet s:mustUnderstand="true">"#);
            for (name, value) in &self.options {
                header.push_str(&format!(
                    r#"<w:Option Name="{name}">{}</w:Option>"#,
                    xml_escape(value)
                ));
            }
            header.push_str("</w:OptionSet>");
        }

        if let Some(locale) = self.locale {
            let locale = xml_escape(locale);
            header.push_str(&format!(
                r#"<w:Locale xml:lang="{locale}" s:mustUnderstand="false"/><p:DataLocale xml:lang="{locale}" s:mustUnderstand="false"/>"#
            ));
        }

        if let Some(timeout) = self.operation_timeout {
            header.push_str(&format!(
                "<w:OperationTimeout>{}</w:OperationTimeout>",
                xml_duration(timeout)
            ));
        }

        if let Some(size) = self.max_envelope_size {
            header.push_str(&format!(
                r#"<w:MaxEnvelopeSize s:mustUnderstand="true">{size}</w:MaxEnvelopeSize>"#
            ));
        }

        format!(
            r#"<?xml version="1.0" encoding="utf-8"?><s:Envelope xmlns:s="{NS_SOAP}" xmlns:a="{NS_ADDRESSING}" xmlns:w="{NS_WSMAN}" xmlns:p="{NS_WSMAN_MS}" xmlns:rsp="{NS_SHELL}" xmlns:n="{NS_ENUMERATION}"><s:Header>{header}</s:Header><s:Body>{body}</s:Body></s:Envelope>"#
        )
    }
}

/// WS-Man Identify needs no addressing headers.
pub fn identify_envelope() -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?><s:Envelope xmlns:s="{NS_SOAP}" xmlns:wsmid="{NS_IDENTITY}"><s:Header/><s:Body><wsmid:Identify/></s:Body></s:Envelope>"#
    )
}

/// Body of a shell Create.
pub fn shell_body(options: &ShellOptions) -> String {
    let mut shell = String::from("<rsp:Shell>");
    if let Some(dir) = &options.working_directory {
        shell.push_str(&format!(
            "<rsp:WorkingDirectory>{}</rsp:WorkingDirectory>",
            xml_escape(dir)
        ));
    }
    if !options.environment.is_empty() {
        shell.push_str("<rsp:Environment>");
        for (name, value) in &options.environment {
            shell.push_str(&format!(
                r#"<rsp:Variable Name="{}">{}</rsp:Variable>"#,
                xml_escape(name),
                xml_escape(value)
            ));
        }
        shell.push_str("</rsp:Environment>");
    }
    shell.push_str(&format!(
        "<rsp:InputStreams>{}</rsp:InputStreams>",
        options.input_streams.join(" ")
    ));
    shell.push_str(&format!(
        "<rsp:OutputStreams>{}</rsp:OutputStreams>",
        options.output_streams.join(" ")
    ));
    if let Some(lifetime) = options.lifetime {
        shell.push_str(&format!("<rsp:Lifetime>{}</rsp:Lifetime>", xml_duration(lifetime)));
    }
    shell.push_str("</rsp:Shell>");
    shell
}

/// Body of a shell Command.
pub fn command_body<S: AsRef<str>>(command: &str, args: &[S]) -> String {
    let mut body = format!(
        "<rsp:CommandLine><rsp:Command>{}</rsp:Command>",
        xml_escape(command)
    );
    for arg in args {
        body.push_str(&format!(
            "<rsp:Arguments>{}</rsp:Arguments>",
            xml_escape(arg.as_ref())
        ));
    }
    body.push_str("</rsp:CommandLine>");
    body
}

/// Body of a shell Receive for `command_id`.
pub fn receive_body(command_id: &str, streams: &[String]) -> String {
    format!(
        r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">{}</rsp:DesiredStream></rsp:Receive>"#,
        xml_escape(command_id),
        streams.join(" ")
    )
}

/// Body of a shell Send carrying `data` on stdin.
pub fn send_body(command_id: &str, data: &[u8], end: bool) -> String {
    let end_attr = if end { r#" End="true""# } else { "" };
    format!(
        r#"<rsp:Send><rsp:Stream Name="stdin" CommandId="{}"{end_attr}>{}</rsp:Stream></rsp:Send>"#,
        xml_escape(command_id),
        BASE64_STANDARD.encode(data)
    )
}

/// Body of a shell Signal.
pub fn signal_body(command_id: &str, signal: Signal) -> String {
    format!(
        r#"<rsp:Signal CommandId="{}"><rsp:Code>{}</rsp:Code></rsp:Signal>"#,
        xml_escape(command_id),
        signal.uri()
    )
}

// ============================================================================
// WMI methods and enumeration
// ============================================================================

/// Input parameters of a WMI method, in the order they are sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodCall {
    method: String,
    params: Vec<(String, Vec<String>)>,
}

impl MethodCall {
    /// Call `method` with no parameters yet.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: Vec::new(),
        }
    }

    /// Add a scalar parameter.
    pub fn arg(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((name.into(), vec![value.to_string()]));
        self
    }

    /// Add an array parameter; each value becomes one repeated element.
    pub fn array<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: ToString,
    {
        self.params
            .push((name.into(), values.into_iter().map(|v| v.to_string()).collect()));
        self
    }

    /// Method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// `<{method}_INPUT>` body in the namespace of `resource_uri`.
    pub fn body(&self, resource_uri: &str) -> String {
        let mut body = format!(
            r#"<m:{}_INPUT xmlns:m="{}">"#,
            self.method,
            xml_escape(resource_uri)
        );
        for (name, values) in &self.params {
            for value in values {
                body.push_str(&format!("<m:{name}>{}</m:{name}>", xml_escape(value)));
            }
        }
        body.push_str(&format!("</m:{}_INPUT>", self.method));
        body
    }
}

/// Body of a WS-Enumeration Enumerate with optimized first batch.
pub fn enumerate_body(max_elements: u32) -> String {
    format!(
        "<n:Enumerate><w:OptimizeEnumeration/><w:MaxElements>{max_elements}</w:MaxElements></n:Enumerate>"
    )
}

/// Body of a Pull continuing `context`.
pub fn pull_body(context: &str, max_elements: u32) -> String {
    format!(
        "<n:Pull><n:EnumerationContext>{}</n:EnumerationContext><n:MaxElements>{max_elements}</n:MaxElements></n:Pull>",
        xml_escape(context)
    )
}

/// Body of a Release abandoning `context`.
pub fn release_body(context: &str) -> String {
    format!(
        "<n:Release><n:EnumerationContext>{}</n:EnumerationContext></n:Release>",
        xml_escape(context)
    )
}

/// Escape text and attribute values.
pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// `xs:duration` for a timeout, e.g. `PT20S` or `PT1.500S`.
pub fn xml_duration(d: Duration) -> String {
    let millis = d.subsec_millis();
    if millis == 0 {
        format!("PT{}S", d.as_secs())
    } else {
        format!("PT{}.{:03}S", d.as_secs(), millis)
    }
}
