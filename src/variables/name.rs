//! The closed catalog of transaction variables.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// How a variable is exposed to rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    /// At most one value.
    Single,
    /// Stored, case-insensitive ordered multimap.
    Map,
    /// Keys of one or more maps, exposed as values.
    Names(&'static [VariableName]),
    /// Logical union of several maps under one name.
    Concat(&'static [VariableName]),
    /// Derived on read (clock, durations, sizes).
    Computed,
}

macro_rules! variable_catalog {
    ($( $(#[$doc:meta])* $variant:ident => $name:literal, )*) => {
        /// Variables a rule can target.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum VariableName {
            $( $(#[$doc])* $variant, )*
        }

        impl VariableName {
            /// Every variable, in declaration order.
            pub const ALL: &'static [VariableName] = &[$(VariableName::$variant,)*];

            /// Canonical upper-case name.
            pub fn name(&self) -> &'static str {
                match self {
                    $( VariableName::$variant => $name, )*
                }
            }
        }
    };
}

variable_catalog! {
    // Request line
    /// HTTP method.
    RequestMethod => "REQUEST_METHOD",
    /// Decoded request URI including query string.
    RequestUri => "REQUEST_URI",
    /// Request URI exactly as received.
    RequestUriRaw => "REQUEST_URI_RAW",
    /// HTTP protocol of the request.
    RequestProtocol => "REQUEST_PROTOCOL",
    /// Full request line.
    RequestLine => "REQUEST_LINE",
    /// Path component of the URI.
    RequestFilename => "REQUEST_FILENAME",
    /// Last path segment.
    RequestBasename => "REQUEST_BASENAME",
    /// Query string without the leading `?`.
    QueryString => "QUERY_STRING",
    /// Extra path info (unused by most adapters).
    PathInfo => "PATH_INFO",

    // Request headers
    /// Request headers.
    RequestHeaders => "REQUEST_HEADERS",
    /// Request header names.
    RequestHeadersNames => "REQUEST_HEADERS_NAMES",
    /// Request cookies.
    RequestCookies => "REQUEST_COOKIES",
    /// Request cookie names.
    RequestCookiesNames => "REQUEST_COOKIES_NAMES",
    /// Authentication scheme from the Authorization header.
    AuthType => "AUTH_TYPE",

    // Request body
    /// Raw request body.
    RequestBody => "REQUEST_BODY",
    /// Request body length in bytes.
    RequestBodyLength => "REQUEST_BODY_LENGTH",
    /// Name of the selected request body processor.
    RequestBodyProcessor => "REQUEST_BODY_PROCESSOR",
    /// Set to 1 when the request body failed to parse.
    ReqbodyError => "REQBODY_ERROR",
    /// Request body error message.
    ReqbodyErrorMsg => "REQBODY_ERROR_MSG",
    /// Set to 1 when the request body processor failed.
    ReqbodyProcessorError => "REQBODY_PROCESSOR_ERROR",
    /// Request body processor error message.
    ReqbodyProcessorErrorMsg => "REQBODY_PROCESSOR_ERROR_MSG",
    /// Set to 1 when the request body was truncated at the limit.
    InboundDataError => "INBOUND_DATA_ERROR",
    /// Set to 1 on malformed url-encoded bodies.
    UrlencodedError => "URLENCODED_ERROR",
    /// Full request (line, headers and body).
    FullRequest => "FULL_REQUEST",
    /// Length of the full request.
    FullRequestLength => "FULL_REQUEST_LENGTH",

    // Arguments
    /// All arguments (query, body, path).
    Args => "ARGS",
    /// Query string arguments.
    ArgsGet => "ARGS_GET",
    /// Body arguments.
    ArgsPost => "ARGS_POST",
    /// Arguments extracted by `@restpath`.
    ArgsPath => "ARGS_PATH",
    /// All argument names.
    ArgsNames => "ARGS_NAMES",
    /// Query argument names.
    ArgsGetNames => "ARGS_GET_NAMES",
    /// Body argument names.
    ArgsPostNames => "ARGS_POST_NAMES",
    /// Combined size of all argument names and values.
    ArgsCombinedSize => "ARGS_COMBINED_SIZE",

    // Multipart / files
    /// Uploaded file names keyed by field.
    Files => "FILES",
    /// Form field names of uploaded files.
    FilesNames => "FILES_NAMES",
    /// Uploaded file sizes keyed by file name.
    FilesSizes => "FILES_SIZES",
    /// Temp file paths of uploaded files.
    FilesTmpnames => "FILES_TMPNAMES",
    /// Contents of uploaded files.
    FilesTmpContent => "FILES_TMP_CONTENT",
    /// Sum of uploaded file sizes.
    FilesCombinedSize => "FILES_COMBINED_SIZE",
    /// Raw part headers keyed by field.
    MultipartPartHeaders => "MULTIPART_PART_HEADERS",
    /// Multipart file names.
    MultipartFilename => "MULTIPART_FILENAME",
    /// Multipart field names.
    MultipartName => "MULTIPART_NAME",
    /// Set when any multipart anomaly flag is set.
    MultipartStrictError => "MULTIPART_STRICT_ERROR",
    /// Boundary parameter was quoted.
    MultipartBoundaryQuoted => "MULTIPART_BOUNDARY_QUOTED",
    /// Boundary parameter contained whitespace.
    MultipartBoundaryWhitespace => "MULTIPART_BOUNDARY_WHITESPACE",
    /// Data after the closing boundary.
    MultipartDataAfter => "MULTIPART_DATA_AFTER",
    /// Data before the first boundary.
    MultipartDataBefore => "MULTIPART_DATA_BEFORE",
    /// Too many files.
    MultipartFileLimitExceeded => "MULTIPART_FILE_LIMIT_EXCEEDED",
    /// Folded part headers.
    MultipartHeaderFolding => "MULTIPART_HEADER_FOLDING",
    /// Invalid header folding.
    MultipartInvalidHeaderFolding => "MULTIPART_INVALID_HEADER_FOLDING",
    /// Part without a usable Content-Disposition.
    MultipartInvalidPart => "MULTIPART_INVALID_PART",
    /// Invalid quoting in Content-Disposition.
    MultipartInvalidQuoting => "MULTIPART_INVALID_QUOTING",
    /// Bare LF line endings.
    MultipartLfLine => "MULTIPART_LF_LINE",
    /// Mixed CRLF and LF line endings.
    MultipartCrlfLfLines => "MULTIPART_CRLF_LF_LINES",
    /// Missing semicolon in Content-Disposition.
    MultipartMissingSemicolon => "MULTIPART_MISSING_SEMICOLON",
    /// Closing boundary missing.
    MultipartUnmatchedBoundary => "MULTIPART_UNMATCHED_BOUNDARY",

    // Response
    /// Response status code.
    ResponseStatus => "RESPONSE_STATUS",
    /// Response protocol.
    ResponseProtocol => "RESPONSE_PROTOCOL",
    /// Status line.
    StatusLine => "STATUS_LINE",
    /// Response headers.
    ResponseHeaders => "RESPONSE_HEADERS",
    /// Response header names.
    ResponseHeadersNames => "RESPONSE_HEADERS_NAMES",
    /// Response body.
    ResponseBody => "RESPONSE_BODY",
    /// Response content type.
    ResponseContentType => "RESPONSE_CONTENT_TYPE",
    /// Response content length.
    ResponseContentLength => "RESPONSE_CONTENT_LENGTH",
    /// Arguments parsed from the response body.
    ResponseArgs => "RESPONSE_ARGS",
    /// Name of the selected response body processor.
    ResbodyProcessor => "RESBODY_PROCESSOR",
    /// Set to 1 when the response body failed to parse.
    ResbodyError => "RESBODY_ERROR",
    /// Response body error message.
    ResbodyErrorMsg => "RESBODY_ERROR_MSG",
    /// Set to 1 when the response body processor failed.
    ResbodyProcessorError => "RESBODY_PROCESSOR_ERROR",
    /// Response body processor error message.
    ResbodyProcessorErrorMsg => "RESBODY_PROCESSOR_ERROR_MSG",
    /// Set to 1 when the response body was truncated.
    OutboundDataError => "OUTBOUND_DATA_ERROR",

    // Structured bodies
    /// XML nodes of the request body.
    RequestXml => "REQUEST_XML",
    /// XML nodes of the response body.
    ResponseXml => "RESPONSE_XML",
    /// Request and response XML.
    Xml => "XML",
    /// JSON paths of the request body.
    Json => "JSON",

    // Connection
    /// Client address.
    RemoteAddr => "REMOTE_ADDR",
    /// Client host name.
    RemoteHost => "REMOTE_HOST",
    /// Client port.
    RemotePort => "REMOTE_PORT",
    /// Authenticated user.
    RemoteUser => "REMOTE_USER",
    /// Server address.
    ServerAddr => "SERVER_ADDR",
    /// Server name (Host header).
    ServerName => "SERVER_NAME",
    /// Server port.
    ServerPort => "SERVER_PORT",
    /// Transaction id.
    UniqueId => "UNIQUE_ID",
    /// Web server error log lines.
    WebserverErrorLog => "WEBSERVER_ERROR_LOG",

    // Operational
    /// Value of the last match.
    MatchedVar => "MATCHED_VAR",
    /// Name of the last match.
    MatchedVarName => "MATCHED_VAR_NAME",
    /// All matches of the current rule.
    MatchedVars => "MATCHED_VARS",
    /// Names of all matches of the current rule.
    MatchedVarsNames => "MATCHED_VARS_NAMES",
    /// Lowest severity number seen so far.
    HighestSeverity => "HIGHEST_SEVERITY",
    /// Microseconds since the transaction started.
    Duration => "DURATION",

    // Clock
    /// Local time `HH:MM:SS`.
    Time => "TIME",
    /// Seconds since the epoch.
    TimeEpoch => "TIME_EPOCH",
    /// Day of month.
    TimeDay => "TIME_DAY",
    /// Hour.
    TimeHour => "TIME_HOUR",
    /// Minute.
    TimeMin => "TIME_MIN",
    /// Second.
    TimeSec => "TIME_SEC",
    /// Day of week, Sunday is 0.
    TimeWday => "TIME_WDAY",
    /// Month, January is 1.
    TimeMon => "TIME_MON",
    /// Year.
    TimeYear => "TIME_YEAR",

    // User collections
    /// Transaction scratch collection.
    Tx => "TX",
    /// Metadata of the rule being evaluated.
    Rule => "RULE",
    /// Environment set by `setenv`.
    Env => "ENV",
    /// Geo lookup results.
    Geo => "GEO",
    /// Persistent per-IP collection.
    Ip => "IP",
    /// Persistent session collection.
    Session => "SESSION",
    /// Persistent user collection.
    User => "USER",
    /// Persistent resource collection.
    Resource => "RESOURCE",
    /// Persistent global collection.
    Global => "GLOBAL",
}

static BY_NAME: Lazy<HashMap<&'static str, VariableName>> = Lazy::new(|| {
    VariableName::ALL
        .iter()
        .map(|v| (v.name(), *v))
        .collect()
});

impl VariableName {
    /// Number of variables in the catalog.
    pub const COUNT: usize = Self::ALL.len();

    /// Look up a variable by name (case-insensitive).
    pub fn from_name(s: &str) -> Option<Self> {
        if let Some(v) = BY_NAME.get(s) {
            return Some(*v);
        }
        BY_NAME.get(s.to_ascii_uppercase().as_str()).copied()
    }

    /// How this variable is stored and resolved.
    pub fn kind(&self) -> VariableKind {
        use VariableName::*;
        match self {
            ArgsGet | ArgsPost | ArgsPath | RequestHeaders | RequestCookies | ResponseHeaders
            | ResponseArgs | Files | FilesNames | FilesSizes | FilesTmpnames | FilesTmpContent
            | MultipartPartHeaders | MultipartFilename | MultipartName | MatchedVars
            | RequestXml | ResponseXml | Json | Tx | Rule | Env | Geo | Ip | Session | User
            | Resource | Global | WebserverErrorLog => VariableKind::Map,

            Args => VariableKind::Concat(&[ArgsGet, ArgsPost, ArgsPath]),
            Xml => VariableKind::Concat(&[RequestXml, ResponseXml]),

            ArgsNames => VariableKind::Names(&[ArgsGet, ArgsPost, ArgsPath]),
            ArgsGetNames => VariableKind::Names(&[ArgsGet]),
            ArgsPostNames => VariableKind::Names(&[ArgsPost]),
            RequestHeadersNames => VariableKind::Names(&[RequestHeaders]),
            RequestCookiesNames => VariableKind::Names(&[RequestCookies]),
            ResponseHeadersNames => VariableKind::Names(&[ResponseHeaders]),
            MatchedVarsNames => VariableKind::Names(&[MatchedVars]),

            Time | TimeEpoch | TimeDay | TimeHour | TimeMin | TimeSec | TimeWday | TimeMon
            | TimeYear | Duration | ArgsCombinedSize => VariableKind::Computed,

            _ => VariableKind::Single,
        }
    }

    /// Whether this variable holds more than one value.
    pub fn is_collection(&self) -> bool {
        !matches!(self.kind(), VariableKind::Single | VariableKind::Computed)
    }

    /// Whether `initcol` can load this collection from the persistence engine.
    pub fn is_persistent(&self) -> bool {
        matches!(
            self,
            Self::Ip | Self::Session | Self::User | Self::Resource | Self::Global
        )
    }

    /// Whether `setvar` may write into this collection.
    pub fn is_writable(&self) -> bool {
        self.is_persistent() || matches!(self, Self::Tx | Self::Env | Self::Geo)
    }
}

impl std::fmt::Display for VariableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_case_insensitive() {
        assert_eq!(VariableName::from_name("ARGS"), Some(VariableName::Args));
        assert_eq!(VariableName::from_name("request_headers"), Some(VariableName::RequestHeaders));
        assert_eq!(VariableName::from_name("NOPE"), None);
    }

    #[test]
    fn test_catalog_indices_are_dense() {
        for (i, v) in VariableName::ALL.iter().enumerate() {
            assert_eq!(*v as usize, i);
        }
        assert!(VariableName::COUNT >= 90);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(VariableName::RequestMethod.kind(), VariableKind::Single);
        assert_eq!(VariableName::Tx.kind(), VariableKind::Map);
        assert!(matches!(VariableName::Args.kind(), VariableKind::Concat(parts) if parts.len() == 3));
        assert!(matches!(VariableName::MatchedVarsNames.kind(), VariableKind::Names(_)));
        assert!(VariableName::Ip.is_persistent());
        assert!(!VariableName::Tx.is_persistent());
    }
}
