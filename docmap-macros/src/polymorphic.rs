use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Error, Fields, LitStr};

// derive_polymorphic
pub fn derive_polymorphic(input: TokenStream) -> TokenStream {
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
            "Polymorphic cannot be derived for generic types",
        ));
    }

    let Data::Enum(data) = &input.data else {
        return Err(Error::new_spanned(
            ident,
            "Polymorphic can only be derived for enums",
        ));
    };

    let name = polymorphic_name(input)?.unwrap_or_else(|| ident.to_string());

    let mut variants = Vec::new();
    for variant in &data.variants {
        let ty = match &variant.fields {
            Fields::Unnamed(unnamed) if unnamed.unnamed.len() == 1 => &unnamed.unnamed[0].ty,
            other => {
                return Err(Error::new_spanned(
                    other,
                    "each Polymorphic variant must wrap exactly one mapped type",
                ));
            }
        };
        variants.push((&variant.ident, ty));
    }

    if variants.is_empty() {
        return Err(Error::new_spanned(
            ident,
            "Polymorphic enums need at least one variant",
        ));
    }

    let refs = variants
        .iter()
        .map(|(_, ty)| quote! { ::docmap::metadata::MappedRef::of::<#ty>() })
        .collect::<Vec<_>>();

    let encode_arms = variants.iter().map(|(variant, _)| {
        quote! {
            Self::#variant(value) => ctx.mapper.encode_polymorphic(value, ctx.field),
        }
    });

    let decode_branches = variants.iter().map(|(variant, ty)| {
        quote! {
            if selected == ::std::any::TypeId::of::<#ty>() {
                return ctx.mapper.decode_embedded::<#ty>(value, ctx).map(Self::#variant);
            }
        }
    });

    Ok(quote! {
        impl ::docmap::codec::FieldCodec for #ident {
            fn shape() -> ::docmap::metadata::FieldShape {
                ::docmap::metadata::FieldShape::Polymorphic {
                    name: #name,
                    variants: ::std::vec![#(#refs),*],
                }
            }

            fn encode(
                &self,
                ctx: &::docmap::mapper::EncodeContext<'_>,
            ) -> ::docmap::error::MappingResult<::docmap::bson::Bson> {
                match self {
                    #(#encode_arms)*
                }
            }

            fn decode(
                value: ::docmap::bson::Bson,
                ctx: &::docmap::mapper::DecodeContext<'_>,
            ) -> ::docmap::error::MappingResult<Self> {
                let variants = [#(#refs),*];
                let selected = ctx.mapper.select_variant(&value, &variants, ctx.field)?;
                #(#decode_branches)*
                Err(::docmap::error::MappingFailure::UnknownDiscriminator {
                    field: ctx.field.name.clone(),
                    discriminator: ::std::string::String::from(#name),
                })
            }
        }
    })
}

fn polymorphic_name(input: &DeriveInput) -> syn::Result<Option<String>> {
    let mut name = None;

    for attr in input.attrs.iter().filter(|attr| attr.path().is_ident("docmap")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value: LitStr = meta.value()?.parse()?;
                name = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported docmap attribute on a polymorphic enum"))
            }
        })?;
    }

    Ok(name)
}
