//! Declarative helpers shared by the wire-level enums.

/// Declares an enum whose variants map 1:1 onto integer codes reported by the
/// device. The first entry (terminated by `;`) is the catch-all for any code
/// without a variant; it is also the `Default`.
macro_rules! define_wire_codes {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(#[$fmeta:meta])*
            $fallback:ident;
            $(
                $(#[$vmeta:meta])*
                $variant:ident = $code:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize)]
        $vis enum $name {
            $(#[$fmeta])*
            #[default]
            $fallback,
            $(
                $(#[$vmeta])*
                $variant,
            )*
        }

        impl $name {
            /// Maps a wire code onto a variant. Unknown codes never fail.
            pub fn from_code(code: i64) -> Self {
                match code {
                    $($code => $name::$variant,)*
                    _ => $name::$fallback,
                }
            }

            /// The wire code of this variant, `None` for the catch-all.
            pub fn code(&self) -> Option<i64> {
                match self {
                    $($name::$variant => Some($code),)*
                    $name::$fallback => None,
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $($name::$variant => stringify!($variant),)*
                    $name::$fallback => stringify!($fallback),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}
