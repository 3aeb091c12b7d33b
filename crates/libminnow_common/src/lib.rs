//! Case-insensitive IRC name types shared by the other libminnow crates.
//!
//! IRC channel names and nicks compare case-insensitively (RFC 2812, section
//! 2.2): ASCII characters fold to lowercase and `[`, `]`, `\`, `~` are
//! considered the lowercase forms of `{`, `}`, `|`, `^`. The types here
//! implement `Eq` and `Hash` under that folding while preserving the casing
//! the name was first seen with for display.

use std::borrow::Borrow;
use std::hash::{Hash, Hasher};
use std::ops::Deref;

// Folding rules:
//
// - ASCII characters are mapped to their lowercase versions
// - '[', ']', '\\', '~' are mapped to '{', '}', '|', '^'. See RFC 2812 section 2.2.
// - Non-ASCII characters are left unchanged.
fn to_lower(c: char) -> char {
    match c {
        '[' => '{',
        ']' => '}',
        '\\' => '|',
        '~' => '^',
        _ => c.to_ascii_lowercase(),
    }
}

fn str_eq_folded(a: &str, b: &str) -> bool {
    // All characters that fold have a 1-byte encoding, so comparing byte
    // lengths first is valid.
    if a.len() != b.len() {
        return false;
    }

    a.chars()
        .map(to_lower)
        .zip(b.chars().map(to_lower))
        .all(|(a, b)| a == b)
}

fn hash_folded<H: Hasher>(s: &str, state: &mut H) {
    s.len().hash(state);
    for c in s.chars() {
        to_lower(c).hash(state);
    }
}

macro_rules! folded_name_type {
    ($owned:ident, $borrowed:ident) => {
        impl Deref for $owned {
            type Target = $borrowed;

            fn deref(&self) -> &Self::Target {
                self.as_ref()
            }
        }

        impl AsRef<$borrowed> for $owned {
            fn as_ref(&self) -> &$borrowed {
                $borrowed::new(self.0.as_ref())
            }
        }

        impl Borrow<$borrowed> for $owned {
            fn borrow(&self) -> &$borrowed {
                self.as_ref()
            }
        }

        impl $owned {
            pub fn new(name: String) -> Self {
                $owned(name)
            }

            /// The name with its original casing.
            pub fn display(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl $borrowed {
            pub fn new(name: &str) -> &Self {
                unsafe { &*(name as *const str as *const $borrowed) }
            }

            /// The name with its original casing.
            pub fn display(&self) -> &str {
                &self.0
            }

            /// The case-folded form, usable as a canonical key.
            pub fn normalized(&self) -> String {
                self.0.chars().map(to_lower).collect()
            }
        }

        impl ToOwned for $borrowed {
            type Owned = $owned;

            fn to_owned(&self) -> Self::Owned {
                $owned(self.0.to_owned())
            }
        }

        impl PartialEq for $owned {
            fn eq(&self, other: &Self) -> bool {
                let self_borrowed: &$borrowed = self.borrow();
                let other_borrowed: &$borrowed = other.borrow();
                self_borrowed.eq(other_borrowed)
            }
        }

        impl Eq for $owned {}

        impl PartialEq<$borrowed> for $owned {
            fn eq(&self, other: &$borrowed) -> bool {
                let self_borrowed: &$borrowed = self.borrow();
                self_borrowed.eq(other)
            }
        }

        impl Hash for $owned {
            fn hash<H: Hasher>(&self, state: &mut H) {
                let self_borrowed: &$borrowed = self.borrow();
                self_borrowed.hash(state)
            }
        }

        impl PartialEq for $borrowed {
            fn eq(&self, other: &Self) -> bool {
                str_eq_folded(&self.0, &other.0)
            }
        }

        impl Eq for $borrowed {}

        impl PartialEq<$owned> for $borrowed {
            fn eq(&self, other: &$owned) -> bool {
                let other_borrowed: &$borrowed = other.borrow();
                self.eq(other_borrowed)
            }
        }

        impl Hash for $borrowed {
            fn hash<H: Hasher>(&self, state: &mut H) {
                hash_folded(&self.0, state)
            }
        }
    };
}

/// Channel names according to RFC 2812, section 1.3. Channel names are case
/// insensitive, so this type defines `Eq` and `Hash` traits that work in a
/// case-insensitive way. `ChanName::display` shows the channel name with the
/// original casing.
#[derive(Debug, Clone)]
pub struct ChanName(String);

/// Slice version of `ChanName`
#[derive(Debug)]
pub struct ChanNameRef(str);

folded_name_type!(ChanName, ChanNameRef);

/// A nick, with the same case-insensitive `Eq` and `Hash` as `ChanName`.
/// Channel member sets are keyed by this type so that lookups fold while the
/// first-seen casing is kept for display.
#[derive(Debug, Clone)]
pub struct Nick(String);

/// Slice version of `Nick`
#[derive(Debug)]
pub struct NickRef(str);

folded_name_type!(Nick, NickRef);
