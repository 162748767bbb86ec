//! Procedural macros for the docmap project.
//!
//! This crate generates the static descriptor tables and field codecs the mapper works
//! from, so no runtime reflection is involved:
//!
//! - `#[derive(Mapped)]` on structs with named fields
//! - `#[derive(Polymorphic)]` on enums whose variants each wrap one mapped type
//! - `#[derive(Symbol)]` on enums of unit variants
//!
//! Generated code refers to the `docmap` crate by its absolute path.

use proc_macro::TokenStream;

mod attrs;
mod mapped;
mod polymorphic;
mod symbol;

#[proc_macro_derive(Mapped, attributes(docmap))]
pub fn derive_mapped(input: TokenStream) -> TokenStream {
    mapped::derive_mapped(input.into()).into()
}

#[proc_macro_derive(Polymorphic, attributes(docmap))]
pub fn derive_polymorphic(input: TokenStream) -> TokenStream {
    polymorphic::derive_polymorphic(input.into()).into()
}

#[proc_macro_derive(Symbol, attributes(docmap))]
pub fn derive_symbol(input: TokenStream) -> TokenStream {
    symbol::derive_symbol(input.into()).into()
}
