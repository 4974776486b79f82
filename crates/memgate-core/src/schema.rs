use serde_json::Value;

/// A compiled JSON Schema together with the document it came from.
pub struct InputSchema {
    raw: Value,
    validator: jsonschema::Validator,
}

impl std::fmt::Debug for InputSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputSchema").field("raw", &self.raw).finish()
    }
}

impl InputSchema {
    pub fn compile(schema: &Value) -> Result<Self, String> {
        let validator = jsonschema::validator_for(schema).map_err(|e| e.to_string())?;
        Ok(Self {
            raw: schema.clone(),
            validator,
        })
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn is_valid(&self, instance: &Value) -> bool {
        self.validator.is_valid(instance)
    }

    /// Every violation, rendered as text. Empty when the instance conforms.
    pub fn violations(&self, instance: &Value) -> Vec<String> {
        self.validator
            .iter_errors(instance)
            .map(|e| e.to_string())
            .collect()
    }
}
