use super::binding::Bindings;
use super::builder::GraphModel;
use super::parsing::NodeKind;
use super::symbols::SymbolTable;
use crate::error::CompileError;
use crate::program::{FieldOrigin, NodeFields, StateField, StateSchema};
use crate::workflow::{BaseType, MergePolicy, TypeDescriptor};
use ahash::AHashMap;
use tracing::{debug, warn};

/// The invocation counter every program carries.
pub const COUNT_FIELD: &str = "count";
/// The global conversation log every program carries.
pub const MESSAGES_FIELD: &str = "messages";
/// Written by routers with the reason for their choice.
pub const ROUTING_REASON_FIELD: &str = "routing_reason";

/// The derived shared-state record plus the bookkeeping field names of each decision node.
#[derive(Debug)]
pub(crate) struct DerivedState {
    pub schema: StateSchema,
    pub node_fields: AHashMap<String, NodeFields>,
}

pub(crate) struct StateSchemaGenerator<'m, 'a> {
    model: &'m GraphModel<'a>,
    bindings: &'m Bindings,
    symbols: &'m SymbolTable,
    fields: Vec<StateField>,
}

impl<'m, 'a> StateSchemaGenerator<'m, 'a> {
    pub(crate) fn new(
        model: &'m GraphModel<'a>,
        bindings: &'m Bindings,
        symbols: &'m SymbolTable,
    ) -> Self {
        Self {
            model,
            bindings,
            symbols,
            fields: Vec::new(),
        }
    }

    pub(crate) fn generate(mut self) -> Result<DerivedState, CompileError> {
        self.mandatory_and_declared();

        let model = self.model;
        let mut node_fields = AHashMap::new();
        for node in model.nodes_of(NodeKind::Decision) {
            let key = self.symbols.key(&node.id).to_string();
            let messages = format!("node_{}_messages", key);
            let calls = format!("node_{}_calls", key);
            self.add_generated(
                &messages,
                TypeDescriptor::new(BaseType::Messages, MergePolicy::Append),
                FieldOrigin::NodeScoped(node.id.clone()),
                &node.id,
            )?;
            self.add_generated(
                &calls,
                TypeDescriptor::new(BaseType::Integer, MergePolicy::Additive),
                FieldOrigin::NodeScoped(node.id.clone()),
                &node.id,
            )?;
            let iterations = if self.bindings.tool_bound.contains(&node.id) {
                let name = format!("node_{}_iterations", key);
                self.add_generated(
                    &name,
                    TypeDescriptor::new(BaseType::Integer, MergePolicy::Overwrite),
                    FieldOrigin::NodeScoped(node.id.clone()),
                    &node.id,
                )?;
                Some(name)
            } else {
                None
            };
            node_fields.insert(
                node.id.clone(),
                NodeFields {
                    messages,
                    calls,
                    iterations,
                },
            );
        }

        if let Some(router) = model.nodes_of(NodeKind::Router).next() {
            self.add_generated(
                ROUTING_REASON_FIELD,
                TypeDescriptor::new(BaseType::Text, MergePolicy::Overwrite).optional(),
                FieldOrigin::Routing,
                &router.id,
            )?;
        }

        for node in model.nodes_of(NodeKind::Decision) {
            let Some(agent) = node.agent() else {
                continue;
            };
            for output in &agent.output_fields {
                self.add_output(
                    &output.name,
                    TypeDescriptor::new(output.base_type.clone(), MergePolicy::Overwrite)
                        .optional(),
                    &node.id,
                )?;
            }
            if let Some(key) = &agent.output_key {
                self.add_output(
                    key,
                    TypeDescriptor::new(BaseType::Text, MergePolicy::Overwrite).optional(),
                    &node.id,
                )?;
            }
        }

        debug!(fields = self.fields.len(), "state schema derived");
        Ok(DerivedState {
            schema: StateSchema {
                fields: self.fields,
            },
            node_fields,
        })
    }

    /// `count` and `messages` come first and keep their policies even when the author
    /// redeclares them.
    fn mandatory_and_declared(&mut self) {
        let declared = &self.model.graph().state_schema;
        let mandatory = [
            (
                COUNT_FIELD,
                TypeDescriptor::new(BaseType::Integer, MergePolicy::Additive),
            ),
            (
                MESSAGES_FIELD,
                TypeDescriptor::new(BaseType::Messages, MergePolicy::Append),
            ),
        ];
        for (name, descriptor) in mandatory {
            if let Some(author) = declared.iter().find(|f| f.name == name) {
                if author.descriptor.merge_policy != descriptor.merge_policy {
                    warn!(
                        field = name,
                        declared = %author.descriptor.merge_policy,
                        enforced = %descriptor.merge_policy,
                        "mandatory field redeclared with a different merge policy"
                    );
                }
            }
            self.fields.push(StateField {
                name: name.to_string(),
                descriptor,
                origin: FieldOrigin::Mandatory,
            });
        }

        for field in declared {
            if field.name == COUNT_FIELD || field.name == MESSAGES_FIELD {
                continue;
            }
            if self.fields.iter().any(|f| f.name == field.name) {
                warn!(field = %field.name, "state field declared twice, keeping the first");
                continue;
            }
            self.fields.push(StateField {
                name: field.name.clone(),
                descriptor: field.descriptor.clone(),
                origin: FieldOrigin::Declared,
            });
        }
    }

    fn add_generated(
        &mut self,
        name: &str,
        descriptor: TypeDescriptor,
        origin: FieldOrigin,
        node_id: &str,
    ) -> Result<(), CompileError> {
        if self.fields.iter().any(|f| f.name == name) {
            return Err(CompileError::FieldCollision {
                field: name.to_string(),
                node_id: node_id.to_string(),
            });
        }
        self.fields.push(StateField {
            name: name.to_string(),
            descriptor,
            origin,
        });
        Ok(())
    }

    /// Output fields may reuse author fields and each other, but never bookkeeping fields.
    fn add_output(
        &mut self,
        name: &str,
        descriptor: TypeDescriptor,
        node_id: &str,
    ) -> Result<(), CompileError> {
        match self.fields.iter().find(|f| f.name == name) {
            Some(existing) => match existing.origin {
                FieldOrigin::Declared | FieldOrigin::Output(_) => Ok(()),
                _ => Err(CompileError::FieldCollision {
                    field: name.to_string(),
                    node_id: node_id.to_string(),
                }),
            },
            None => {
                self.fields.push(StateField {
                    name: name.to_string(),
                    descriptor,
                    origin: FieldOrigin::Output(node_id.to_string()),
                });
                Ok(())
            }
        }
    }
}
