use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Error, Fields};

use crate::attrs::VariantAttrs;

// derive_symbol
pub fn derive_symbol(input: TokenStream) -> TokenStream {
    let input: DeriveInput = match syn::parse2(input) {
        Ok(input) => input,
        Err(err) => return err.to_compile_error(),
    };

    match expand(&input) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream> {
    let ident = &input.ident;

    if !input.generics.params.is_empty() {
        return Err(Error::new_spanned(
            &input.generics,
            "Symbol cannot be derived for generic types",
        ));
    }

    let Data::Enum(data) = &input.data else {
        return Err(Error::new_spanned(
            ident,
            "Symbol can only be derived for enums of unit variants",
        ));
    };

    let mut variants = Vec::new();
    for variant in &data.variants {
        if !matches!(variant.fields, Fields::Unit) {
            return Err(Error::new_spanned(
                variant,
                "Symbol variants cannot carry data",
            ));
        }

        let attrs = VariantAttrs::parse(&variant.attrs)?;
        let name = attrs
            .rename
            .map(|rename| rename.value())
            .unwrap_or_else(|| variant.ident.to_string());
        variants.push((&variant.ident, name));
    }

    let name_arms = variants.iter().map(|(variant, name)| {
        quote! { Self::#variant => #name, }
    });
    let from_name_arms = variants.iter().map(|(variant, name)| {
        quote! { #name => ::std::option::Option::Some(Self::#variant), }
    });

    Ok(quote! {
        impl ::docmap::codec::Symbol for #ident {
            fn name(&self) -> &'static str {
                match self {
                    #(#name_arms)*
                }
            }

            fn from_name(name: &str) -> ::std::option::Option<Self> {
                match name {
                    #(#from_name_arms)*
                    _ => ::std::option::Option::None,
                }
            }
        }

        impl ::docmap::codec::FieldCodec for #ident {
            fn shape() -> ::docmap::metadata::FieldShape {
                ::docmap::metadata::FieldShape::Symbol(::std::any::type_name::<Self>())
            }

            fn encode(
                &self,
                ctx: &::docmap::mapper::EncodeContext<'_>,
            ) -> ::docmap::error::MappingResult<::docmap::bson::Bson> {
                ::docmap::codec::encode_symbol(self, ctx)
            }

            fn decode(
                value: ::docmap::bson::Bson,
                ctx: &::docmap::mapper::DecodeContext<'_>,
            ) -> ::docmap::error::MappingResult<Self> {
                ::docmap::codec::decode_symbol(value, ctx)
            }
        }
    })
}
