use proc_macro2::TokenStream;
use quote::{quote, quote_spanned};
use syn::{spanned::Spanned, Data, DeriveInput, Error, Field, Fields, Ident};

use crate::attrs::{ContainerAttrs, FieldAttrs};

// derive_mapped
pub fn derive_mapped(input: TokenStream) -> TokenStream {
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
            "Mapped cannot be derived for generic types",
        ));
    }

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(named) => &named.named,
            other => {
                return Err(Error::new_spanned(
                    other,
                    "Mapped can only be derived for structs with named fields",
                ));
            }
        },
        _ => {
            return Err(Error::new_spanned(
                ident,
                "Mapped can only be derived for structs with named fields",
            ));
        }
    };

    let container = ContainerAttrs::parse(&input.attrs)?;
    let name = container
        .name
        .as_ref()
        .map(|name| name.value())
        .unwrap_or_else(|| ident.to_string());

    let mut persisted = Vec::new();
    for field in fields {
        let attrs = FieldAttrs::parse(&field.attrs)?;
        if !attrs.transient {
            persisted.push(PersistedField::new(field, attrs)?);
        }
    }

    let id_count = persisted.iter().filter(|field| field.attrs.id).count();
    if id_count > 1 {
        return Err(Error::new_spanned(
            ident,
            "only one field may be marked #[docmap(id)]",
        ));
    }

    let reference_checks = persisted
        .iter()
        .filter_map(PersistedField::reference_check)
        .collect::<Vec<_>>();
    let reference_checks = (!reference_checks.is_empty()).then(|| {
        quote! {
            const _: () = {
                fn require_reference_field<V: ::docmap::reference::ReferenceField>() {}
                #(#reference_checks)*
            };
        }
    });

    let descriptors = persisted.iter().map(PersistedField::descriptor);
    let writes = persisted.iter().map(PersistedField::write);
    let reads = persisted.iter().map(PersistedField::read);

    let collection = container.collection.as_ref().map(|collection| {
        quote! { .collection(#collection) }
    });
    let capped = container.capped.as_ref().map(|capped| {
        let size = &capped.size;
        let max = match &capped.max {
            Some(max) => quote! { ::std::option::Option::Some(#max) },
            None => quote! { ::std::option::Option::None },
        };
        quote! {
            .capped(::docmap::metadata::CappedSpec { size: #size, max: #max })
        }
    });

    let has_pre_persist = container.pre_persist.is_some();
    let has_post_persist = container.post_persist.is_some();
    let has_post_load = container.post_load.is_some();

    let pre_persist = container.pre_persist.as_ref().map(|method| {
        quote! {
            fn pre_persist(&mut self) {
                self.#method();
            }
        }
    });
    let post_persist = container.post_persist.as_ref().map(|method| {
        quote! {
            fn post_persist(&mut self, document: &::docmap::bson::Document) {
                self.#method(document);
            }
        }
    });
    let post_load = container.post_load.as_ref().map(|method| {
        quote! {
            fn post_load(&mut self, document: &::docmap::bson::Document) {
                self.#method(document);
            }
        }
    });

    Ok(quote! {
        impl ::docmap::mapper::Mapped for #ident {
            fn descriptor() -> ::docmap::metadata::ClassDescriptor {
                ::docmap::metadata::ClassDescriptor::new::<Self>(#name)
                    #collection
                    #capped
                    .hooks(::docmap::metadata::LifecycleHooks {
                        pre_persist: #has_pre_persist,
                        post_persist: #has_post_persist,
                        post_load: #has_post_load,
                    })
                    #(.field(#descriptors))*
            }

            fn write_fields(
                &self,
                writer: &mut ::docmap::mapper::FieldWriter<'_>,
            ) -> ::docmap::error::MappingResult<()> {
                #(#writes)*
                Ok(())
            }

            fn read_fields(
                &mut self,
                reader: &::docmap::mapper::FieldReader<'_>,
            ) -> ::docmap::error::MappingResult<()> {
                #(#reads)*
                Ok(())
            }

            #pre_persist
            #post_persist
            #post_load
        }

        #reference_checks

        impl ::docmap::codec::FieldCodec for #ident {
            fn shape() -> ::docmap::metadata::FieldShape {
                ::docmap::metadata::FieldShape::Embedded(
                    ::docmap::metadata::MappedRef::of::<Self>(),
                )
            }

            fn encode(
                &self,
                ctx: &::docmap::mapper::EncodeContext<'_>,
            ) -> ::docmap::error::MappingResult<::docmap::bson::Bson> {
                ctx.mapper.encode_embedded(self, ctx.field)
            }

            fn decode(
                value: ::docmap::bson::Bson,
                ctx: &::docmap::mapper::DecodeContext<'_>,
            ) -> ::docmap::error::MappingResult<Self> {
                ctx.mapper.decode_embedded(value, ctx)
            }
        }
    })
}

///
/// PersistedField
///

struct PersistedField<'a> {
    ident: &'a Ident,
    field: &'a Field,
    attrs: FieldAttrs,
}

impl<'a> PersistedField<'a> {
    fn new(field: &'a Field, attrs: FieldAttrs) -> syn::Result<Self> {
        let ident = field
            .ident
            .as_ref()
            .ok_or_else(|| Error::new_spanned(field, "expected a named field"))?;

        Ok(Self {
            ident,
            field,
            attrs,
        })
    }

    // Fails to compile unless the field type is a reference, a key or a container of them.
    fn reference_check(&self) -> Option<TokenStream> {
        if !(self.attrs.reference || self.attrs.lazy) {
            return None;
        }
        let ty = &self.field.ty;
        Some(quote_spanned! {ty.span()=>
            let _ = require_reference_field::<#ty>;
        })
    }

    fn descriptor(&self) -> TokenStream {
        let ty = &self.field.ty;
        let name = self.ident.to_string();
        let attrs = &self.attrs;

        let mut tokens = if attrs.convert {
            quote! { ::docmap::metadata::FieldDescriptor::converted::<#ty>(#name) }
        } else {
            quote! { ::docmap::metadata::FieldDescriptor::of::<#ty>(#name) }
        };

        if attrs.id {
            tokens.extend(quote! { .id() });
        }
        if attrs.embedded {
            tokens.extend(quote! { .embedded() });
        }
        if attrs.reference {
            tokens.extend(quote! { .reference() });
        }
        if attrs.lazy {
            tokens.extend(quote! { .lazy() });
        }
        if let Some(rename) = &attrs.rename {
            tokens.extend(quote! { .rename(#rename) });
        }
        if attrs.store_null {
            tokens.extend(quote! { .store_null() });
        }
        if let Some(indexed) = &attrs.indexed {
            let direction = if indexed.desc {
                quote! { ::docmap::query::SortDirection::Desc }
            } else {
                quote! { ::docmap::query::SortDirection::Asc }
            };
            let unique = indexed.unique;
            let drop_dups = indexed.drop_dups;
            let index_name = match &indexed.name {
                Some(index_name) => {
                    quote! { ::std::option::Option::Some(::std::string::String::from(#index_name)) }
                }
                None => quote! { ::std::option::Option::None },
            };
            tokens.extend(quote! {
                .indexed(::docmap::metadata::IndexSpec {
                    direction: #direction,
                    unique: #unique,
                    name: #index_name,
                    drop_dups: #drop_dups,
                })
            });
        }

        tokens
    }

    fn write(&self) -> TokenStream {
        let ident = self.ident;
        let name = ident.to_string();

        if self.attrs.convert {
            quote! { writer.write_converted(#name, &self.#ident)?; }
        } else {
            quote! { writer.write(#name, &self.#ident)?; }
        }
    }

    fn read(&self) -> TokenStream {
        let ident = self.ident;
        let ty = &self.field.ty;
        let name = ident.to_string();

        let read = if self.attrs.convert {
            quote! { reader.read_converted::<#ty>(#name)? }
        } else {
            quote! { reader.read::<#ty>(#name)? }
        };

        quote! {
            if let ::std::option::Option::Some(value) = #read {
                self.#ident = value;
            }
        }
    }
}
