/*
Copyright 2025 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use chrono::Utc;
use gateway_api::apis::standard::{gatewayclasses::GatewayClass, gateways::Gateway};
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;

/// Gateway API objects whose status carries a flat condition list.
pub trait Conditioned {
    fn conditions(&self) -> &[metav1::Condition];
    fn conditions_mut(&mut self) -> &mut Vec<metav1::Condition>;
}

impl Conditioned for Gateway {
    fn conditions(&self) -> &[metav1::Condition] {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.as_deref())
            .unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<metav1::Condition> {
        self.status
            .get_or_insert_with(Default::default)
            .conditions
            .get_or_insert_with(Vec::new)
    }
}

impl Conditioned for GatewayClass {
    fn conditions(&self) -> &[metav1::Condition] {
        self.status
            .as_ref()
            .and_then(|status| status.conditions.as_deref())
            .unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<metav1::Condition> {
        self.status
            .get_or_insert_with(Default::default)
            .conditions
            .get_or_insert_with(Vec::new)
    }
}

/// Builds a condition stamped with the current time.
pub fn new_condition(
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> metav1::Condition {
    metav1::Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation,
        last_transition_time: metav1::Time(Utc::now()),
    }
}

/// Upserts `new_cond` by condition type. A condition whose status did not
/// change keeps its original transition time and message; only the observed
/// generation moves forward.
pub fn set_condition<T: Conditioned>(obj: &mut T, new_cond: metav1::Condition) {
    let conditions = obj.conditions_mut();
    match conditions
        .iter_mut()
        .find(|condition| condition.type_ == new_cond.type_)
    {
        Some(existing) if existing.status == new_cond.status => {
            existing.observed_generation = new_cond.observed_generation;
        }
        Some(existing) => *existing = new_cond,
        None => conditions.push(new_cond),
    }
}

/// True when the object currently carries `type_` with status "True".
pub fn condition_is_true<T: Conditioned>(obj: &T, type_: &str) -> bool {
    obj.conditions()
        .iter()
        .any(|condition| condition.type_ == type_ && condition.status == "True")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gateway_class() -> GatewayClass {
        serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "GatewayClass",
            "metadata": {"name": "aska", "generation": 1},
            "spec": {"controllerName": "gateway.networking.k8s.io/aska"},
        }))
        .expect("gatewayclass fixture must deserialize")
    }

    #[test]
    fn sets_conditions_on_an_empty_status() {
        let mut gwc = gateway_class();
        assert!(gwc.conditions().is_empty());
        assert!(!condition_is_true(&gwc, "Accepted"));

        set_condition(
            &mut gwc,
            new_condition("Accepted", "True", "Accepted", "accepted", Some(1)),
        );
        assert_eq!(gwc.conditions().len(), 1);
        assert!(condition_is_true(&gwc, "Accepted"));
    }

    #[test]
    fn same_status_only_moves_the_generation_forward() {
        let mut gwc = gateway_class();
        set_condition(
            &mut gwc,
            new_condition("Accepted", "True", "Accepted", "first message", Some(1)),
        );
        set_condition(
            &mut gwc,
            new_condition("Accepted", "True", "Accepted", "second message", Some(2)),
        );

        let conditions = gwc.conditions();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "first message");
        assert_eq!(conditions[0].observed_generation, Some(2));
    }

    #[test]
    fn changed_status_replaces_the_condition() {
        let mut gwc = gateway_class();
        set_condition(
            &mut gwc,
            new_condition("Accepted", "True", "Accepted", "accepted", Some(1)),
        );
        set_condition(
            &mut gwc,
            new_condition("Accepted", "False", "Invalid", "broken", Some(2)),
        );

        let conditions = gwc.conditions();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, "False");
        assert_eq!(conditions[0].message, "broken");
        assert!(!condition_is_true(&gwc, "Accepted"));
    }

    #[test]
    fn distinct_types_accumulate() {
        let mut gwc = gateway_class();
        set_condition(
            &mut gwc,
            new_condition("Accepted", "True", "Accepted", "accepted", Some(1)),
        );
        set_condition(
            &mut gwc,
            new_condition("Programmed", "False", "Pending", "waiting", Some(1)),
        );

        assert_eq!(gwc.conditions().len(), 2);
        assert!(condition_is_true(&gwc, "Accepted"));
        assert!(!condition_is_true(&gwc, "Programmed"));
    }
}
