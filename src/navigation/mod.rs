//! Current-directory tracking for one side of the session, with
//! platform-aware parent computation for "go up" navigation.

/// Path separator rules for the filesystem being browsed. Explicit rather
/// than inferred from the build target, because the remote side of a
/// session may run a different platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    /// Drive-letter roots like `C:\`.
    Windows,
    /// A single `/` root.
    Posix,
}

impl PathStyle {
    pub fn native() -> Self {
        if cfg!(windows) {
            PathStyle::Windows
        } else {
            PathStyle::Posix
        }
    }

    fn separator(self) -> char {
        match self {
            PathStyle::Windows => '\\',
            PathStyle::Posix => '/',
        }
    }

    fn is_separator(self, c: char) -> bool {
        match self {
            // Windows paths accept both separators.
            PathStyle::Windows => c == '\\' || c == '/',
            PathStyle::Posix => c == '/',
        }
    }
}

/// The parent of `path`, or the empty root sentinel once the parent would
/// be a drive root. The empty sentinel maps to the drive-selection view.
pub fn parent_of(path: &str, style: PathStyle) -> String {
    if path.is_empty() {
        return String::new();
    }

    let trimmed = path.trim_end_matches(|c| style.is_separator(c));
    let parent = match trimmed.rfind(|c| style.is_separator(c)) {
        Some(idx) => &path[..=idx],
        None => return String::new(),
    };

    match style {
        // "C:\x" has parent "C:\" which is a drive root.
        PathStyle::Windows if parent.trim_end_matches(|c| style.is_separator(c)).len() <= 2 => {
            String::new()
        }
        PathStyle::Posix if parent.trim_end_matches('/').is_empty() => String::new(),
        _ => parent
            .trim_end_matches(|c| style.is_separator(c))
            .to_string(),
    }
}

/// Join a child entry name onto a directory, or onto the root sentinel
/// (where the child is itself a drive path and is taken verbatim).
pub fn join_child(dir: &str, child: &str, style: PathStyle) -> String {
    if dir.is_empty() {
        return child.to_string();
    }
    let sep = style.separator();
    if dir.ends_with(|c| style.is_separator(c)) {
        format!("{dir}{child}")
    } else {
        format!("{dir}{sep}{child}")
    }
}

/// Tracks the directory currently shown for one side of the session.
#[derive(Debug, Clone)]
pub struct NavigationState {
    current: String,
    style: PathStyle,
}

impl NavigationState {
    pub fn new(style: PathStyle) -> Self {
        Self {
            current: String::new(),
            style,
        }
    }

    /// The directory currently shown; empty means the drive-root view.
    pub fn current_dir(&self) -> &str {
        &self.current
    }

    pub fn is_at_root(&self) -> bool {
        self.current.is_empty()
    }

    /// Record a directory as current. Call only once its listing has
    /// actually been rendered, never speculatively.
    pub fn enter(&mut self, path: &str) {
        self.current = path.to_string();
    }

    /// The path to request for "go up" navigation.
    pub fn parent(&self) -> String {
        parent_of(&self.current, self.style)
    }

    /// The path to request when descending into a child entry.
    pub fn child(&self, name: &str) -> String {
        join_child(&self.current, name, self.style)
    }
}
