use serde_json::Value;

use crate::validation::ValidationError;

/// A closed catalog of job kinds, usually an enum with one variant per job name.
///
/// Implement it with [`job_catalog!`](crate::job_catalog) rather than by hand: the
/// macro keeps names, payload types and decoding in one place and refuses to
/// compile a catalog that reuses a name.
pub trait JobKind: Sized + Send + Sync + 'static {
    /// Every job name in the catalog.
    const NAMES: &'static [&'static str];

    fn name(&self) -> &'static str;

    fn payload(&self) -> Result<Value, serde_json::Error>;

    /// Validates `payload` against the schema registered for `name`.
    fn decode(name: &str, payload: Value) -> Result<Self, ValidationError>;

    fn queue_name(&self) -> &'static str {
        queue_name_for(self.name())
    }
}

/// Queue a job name is routed to: everything before the first `.`.
pub fn queue_name_for(job_name: &str) -> &str {
    job_name
        .split_once('.')
        .map_or(job_name, |(queue, _)| queue)
}

#[doc(hidden)]
pub const fn names_are_unique(names: &[&str]) -> bool {
    let mut i = 0;
    while i < names.len() {
        let mut j = i + 1;
        while j < names.len() {
            if str_eq(names[i], names[j]) {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}

const fn str_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut i = 0;
    while i < a.len() {
        if a[i] != b[i] {
            return false;
        }
        i += 1;
    }
    true
}

/// Declares a job catalog enum and implements [`JobKind`] for it.
///
/// ```rust
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct EmailSend {
///     pub to: String,
///     pub name: String,
///     pub data: serde_json::Value,
/// }
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// pub struct SlackPost {
///     pub channel: String,
///     pub text: String,
/// }
///
/// courier::job_catalog! {
///     #[derive(Debug, Clone)]
///     pub enum AppJob {
///         EmailSend(EmailSend) = "notification.email.send",
///         SlackPost(SlackPost) = "slack.post",
///     }
/// }
/// ```
#[macro_export]
macro_rules! job_catalog {
    (
        $(#[$meta:meta])*
        $vis:vis enum $catalog:ident {
            $( $variant:ident ( $payload:ty ) = $name:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $catalog {
            $( $variant($payload), )+
        }

        impl $crate::JobKind for $catalog {
            const NAMES: &'static [&'static str] = &[ $( $name ),+ ];

            fn name(&self) -> &'static str {
                match self {
                    $( Self::$variant(_) => $name, )+
                }
            }

            fn payload(
                &self,
            ) -> ::std::result::Result<$crate::__private::Value, $crate::__private::JsonError> {
                match self {
                    $( Self::$variant(payload) => $crate::__private::to_value(payload), )+
                }
            }

            fn decode(
                name: &str,
                payload: $crate::__private::Value,
            ) -> ::std::result::Result<Self, $crate::ValidationError> {
                match name {
                    $(
                        $name => $crate::__private::decode_payload::<$payload>(name, payload)
                            .map(Self::$variant),
                    )+
                    _ => ::std::result::Result::Err($crate::ValidationError::unknown_job(name)),
                }
            }
        }

        const _: () = ::std::assert!(
            $crate::__private::names_are_unique(<$catalog as $crate::JobKind>::NAMES),
            "job catalog contains a duplicate job name"
        );
    };
}
