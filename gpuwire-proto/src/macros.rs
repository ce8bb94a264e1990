//! Declarative helpers shared by the command modules.

/// Declares a tag enum plus a union of the decoded commands it names.
///
/// Every `Name = tag` pair requires a `Name` type implementing
/// [`Decode`](crate::Decode) and [`Command`](crate::Command) with that tag.
macro_rules! command_set {
    (
        $(#[$tag_meta:meta])*
        tag $tag_ty:ident;
        $(#[$union_meta:meta])*
        union $union:ident;

        $($name:ident = $tag:literal,)*
    ) => {
        $(#[$tag_meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        #[non_exhaustive]
        #[repr(u32)]
        pub enum $tag_ty {
            $(
                #[doc = concat!("Tag of [`", stringify!($name), "`].")]
                $name = $tag,
            )*
        }

        impl $tag_ty {
            /// Decodes a tag.
            pub const fn from_u32(tag: u32) -> Option<Self> {
                match tag {
                    $($tag => Some(Self::$name),)*
                    _ => None,
                }
            }

            /// Name of the command.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$name => stringify!($name),)*
                }
            }
        }

        impl std::fmt::Display for $tag_ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.name())
            }
        }

        $(#[$union_meta])*
        #[derive(Debug, Clone, PartialEq, Serialize)]
        #[non_exhaustive]
        pub enum $union {
            $(
                #[doc = concat!("A decoded [`", stringify!($name), "`].")]
                $name($name),
            )*
        }

        impl $union {
            /// Decodes the complete command in `bytes`.
            pub fn decode(
                bytes: &[u8],
                alloc: &mut $crate::DeserializeAllocator,
            ) -> $crate::WireResult<Self> {
                let (_, tag) = $crate::codec::peek_envelope(bytes)?;
                match $tag_ty::from_u32(tag) {
                    $(Some($tag_ty::$name) => {
                        $crate::codec::deserialize_command(bytes, alloc).map(Self::$name)
                    })*
                    None => Err($crate::WireError::UnknownCommand(tag)),
                }
            }

            /// Encodes the command back into its wire form.
            pub fn encode(&self) -> $crate::WireResult<Vec<u8>> {
                match self {
                    $(Self::$name(c) => $crate::codec::encode_command(c, &$crate::HandleIds),)*
                }
            }

            /// Tag of the command.
            pub const fn tag(&self) -> $tag_ty {
                match self {
                    $(Self::$name(_) => $tag_ty::$name,)*
                }
            }
        }
    };
}
