//! Line scanner turning rule file text into raw directory blocks
//!
//! The scanner only understands section markers and comments; what a line means inside a
//! section is decided by the compiler.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub number: usize,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct RawDestination {
    pub line: usize,
    pub name: String,
    pub recipients: Vec<Line>,
    pub options: Vec<Line>,
}

#[derive(Debug, Clone, Default)]
pub struct RawFileGroup {
    pub line: usize,
    pub name: String,
    pub filters: Vec<Line>,
    pub destinations: Vec<RawDestination>,
}

#[derive(Debug, Clone, Default)]
pub struct RawDirectory {
    pub line: usize,
    /// first header token with its escapes still in place
    pub location: String,
    pub alias: Option<String>,
    pub options: Vec<Line>,
    pub groups: Vec<RawFileGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanWarning {
    pub line: usize,
    pub message: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Marker {
    Directory,
    DirOptions,
    Files,
    Destination,
    Recipient,
    Options,
}

impl Marker {
    fn from_name(name: &str) -> Option<Self> {
        let marker = match name.trim().to_ascii_lowercase().as_str() {
            "directory" => Self::Directory,
            "dir options" => Self::DirOptions,
            "files" => Self::Files,
            "destination" => Self::Destination,
            "recipient" => Self::Recipient,
            "options" => Self::Options,
            _ => return None,
        };
        Some(marker)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    SeekDirectory,
    DirOptions,
    SeekFileGroup,
    FileFilters,
    SeekDestination,
    Recipients,
    DestinationOptions,
}

/// Cuts a `#` comment off; `#` starts one at line start or after whitespace, `\#` is literal.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'\\' => idx += 2,
            b'#' if idx == 0 || bytes[idx - 1].is_ascii_whitespace() => return &line[..idx],
            _ => idx += 1,
        }
    }
    line
}

/// Splits the header into its first token (escaped blanks do not split) and the rest.
pub fn split_header(args: &str) -> (String, Option<String>) {
    let bytes = args.as_bytes();
    let mut idx = 0;
    while idx < bytes.len() && !bytes[idx].is_ascii_whitespace() {
        idx += if bytes[idx] == b'\\' { 2 } else { 1 };
    }
    let idx = idx.min(bytes.len());
    let rest = args[idx..].trim();
    (
        args[..idx].to_string(),
        (!rest.is_empty()).then(|| rest.to_string()),
    )
}

/// Removes backslash escapes from a local path token.
pub fn unescape(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Splits rule file content into directory blocks.
pub fn scan(content: &str) -> (Vec<RawDirectory>, Vec<ScanWarning>) {
    let mut directories: Vec<RawDirectory> = Vec::new();
    let mut warnings = Vec::new();
    let mut state = State::SeekDirectory;
    let mut warn = |line: usize, message: String| warnings.push(ScanWarning { line, message });
    for (idx, raw_line) in content.lines().enumerate() {
        let number = idx + 1;
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            // a blank line ends the content of the current section
            state = match state {
                State::SeekDirectory => State::SeekDirectory,
                State::DirOptions | State::SeekFileGroup => State::SeekFileGroup,
                State::FileFilters | State::SeekDestination => State::SeekDestination,
                State::Recipients | State::DestinationOptions => State::SeekDestination,
            };
            continue;
        }
        if let Some(inner) = line.strip_prefix('[')
            && let Some(close) = inner.find(']')
        {
            let args = inner[close + 1..].trim();
            let Some(marker) = Marker::from_name(&inner[..close]) else {
                warn(number, format!("unknown section marker '[{}]'", &inner[..close]));
                continue;
            };
            match marker {
                Marker::Directory => {
                    if args.is_empty() {
                        warn(number, "directory marker without a location".to_string());
                        state = State::SeekDirectory;
                        continue;
                    }
                    let (location, alias) = split_header(args);
                    directories.push(RawDirectory {
                        line: number,
                        location,
                        alias,
                        ..RawDirectory::default()
                    });
                    state = State::SeekFileGroup;
                }
                Marker::DirOptions => match directories.last() {
                    Some(_) => state = State::DirOptions,
                    None => warn(number, "[dir options] outside of a directory".to_string()),
                },
                Marker::Files => match directories.last_mut() {
                    Some(dir) => {
                        dir.groups.push(RawFileGroup {
                            line: number,
                            name: args.to_string(),
                            ..RawFileGroup::default()
                        });
                        state = State::FileFilters;
                    }
                    None => warn(number, "[files] outside of a directory".to_string()),
                },
                Marker::Destination => {
                    match directories.last_mut().and_then(|dir| dir.groups.last_mut()) {
                        Some(group) => {
                            group.destinations.push(RawDestination {
                                line: number,
                                name: args.to_string(),
                                ..RawDestination::default()
                            });
                            state = State::SeekDestination;
                        }
                        None => warn(number, "[destination] outside of a file group".to_string()),
                    }
                }
                Marker::Recipient | Marker::Options => {
                    let has_destination = directories
                        .last()
                        .and_then(|dir| dir.groups.last())
                        .is_some_and(|group| !group.destinations.is_empty());
                    if has_destination {
                        state = if marker == Marker::Recipient {
                            State::Recipients
                        } else {
                            State::DestinationOptions
                        };
                    } else {
                        warn(number, format!("[{}] outside of a destination", &inner[..close]));
                    }
                }
            }
            continue;
        }
        let text = Line {
            number,
            text: line.to_string(),
        };
        let dir = directories.last_mut();
        let group = dir.and_then(|dir| match state {
            State::DirOptions => {
                dir.options.push(text.clone());
                None
            }
            _ => dir.groups.last_mut(),
        });
        match (state, group) {
            (State::DirOptions, _) => {}
            (State::FileFilters, Some(group)) => group.filters.push(text),
            (State::Recipients, Some(group)) => {
                if let Some(dest) = group.destinations.last_mut() {
                    dest.recipients.push(text);
                }
            }
            (State::DestinationOptions, Some(group)) => {
                if let Some(dest) = group.destinations.last_mut() {
                    dest.options.push(text);
                }
            }
            _ => warn(number, format!("line '{}' is not inside any section", line)),
        }
    }
    (directories, warnings)
}
