//! Route construction: concrete request paths paired with stable
//! rate-limit bucket keys.
//!
//! Many concrete paths share one server-side rate limit. The bucket key
//! collapses numeric ids to `:id` — except directly under a major
//! container (`channels`, `guilds`, `webhooks`), whose id genuinely
//! partitions the limit — and freezes at a `reactions` segment because
//! everything under reactions shares a single bucket.

/// Path segments whose following id stays literal in the bucket key.
const MAJOR_CONTAINERS: [&str; 3] = ["channels", "guilds", "webhooks"];

/// Segment that freezes the bucket key.
const REACTIONS: &str = "reactions";

/// An immutable chain of path segments. Each [`join`](Route::join)
/// returns a new node, so partial routes can be kept and extended freely;
/// the terminal consumer reads both the concrete path and the bucket key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    path: String,
    bucket: String,
    last_segment: String,
    frozen: bool,
}

impl Route {
    /// The API root.
    pub fn root() -> Self {
        Self {
            path: String::new(),
            bucket: String::new(),
            last_segment: String::new(),
            frozen: false,
        }
    }

    /// Build a route in one call from ready-made segments.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        segments
            .into_iter()
            .fold(Self::root(), |route, segment| route.join(segment.as_ref()))
    }

    /// Append one segment, extending the path and (unless frozen) the
    /// bucket key.
    pub fn join(&self, segment: &str) -> Self {
        let mut path = self.path.clone();
        path.push('/');
        path.push_str(segment);

        let mut bucket = self.bucket.clone();
        let mut frozen = self.frozen;
        if !frozen {
            bucket.push('/');
            if is_snowflake(segment) && !MAJOR_CONTAINERS.contains(&self.last_segment.as_str()) {
                bucket.push_str(":id");
            } else {
                bucket.push_str(segment);
            }
            if segment == REACTIONS {
                frozen = true;
            }
        }

        Self { path, bucket, last_segment: segment.to_owned(), frozen }
    }

    /// The concrete request path, e.g. `/channels/1234/messages/5678`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The rate-limit bucket key, e.g. `/channels/1234/messages/:id`.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Pre-discovery handler key for a given HTTP method.
    pub fn handler_key(&self, method: &str) -> String {
        format!("{}:{}", method.to_ascii_uppercase(), self.bucket)
    }

    /// Whether this route touches reactions, which get special reset
    /// padding.
    pub fn is_reaction_route(&self) -> bool {
        self.frozen
    }
}

/// A numeric id segment: 16 to 19 ASCII digits.
fn is_snowflake(segment: &str) -> bool {
    (16..=19).contains(&segment.len()) && segment.bytes().all(|b| b.is_ascii_digit())
}
