//! Provider status from terraform outputs

use std::collections::BTreeMap;

use super::values::{
    TF_OUTPUT_CLOUD_ROUTER, TF_OUTPUT_NAT_IPS, TF_OUTPUT_SERVICE_ACCOUNT_EMAIL,
    TF_OUTPUT_SUBNET_INTERNAL, TF_OUTPUT_SUBNET_NODES, TF_OUTPUT_VPC_NAME,
};
use crate::crd::provider::{
    CloudRouter, InfrastructureStatus, NatIp, Subnet, SubnetPurpose, Vpc,
};
use crate::error::{Error, Result};

pub fn status_from_outputs(outputs: &BTreeMap<String, String>) -> Result<InfrastructureStatus> {
    let required = |key: &str| {
        outputs
            .get(key)
            .cloned()
            .ok_or_else(|| Error::TerraformerError(format!("terraform output {key} is missing")))
    };

    let mut status = InfrastructureStatus::default();
    status.networks.vpc = Vpc {
        name: required(TF_OUTPUT_VPC_NAME)?,
        cloud_router: outputs
            .get(TF_OUTPUT_CLOUD_ROUTER)
            .filter(|name| !name.is_empty())
            .map(|name| CloudRouter { name: name.clone() }),
    };
    status.networks.subnets.push(Subnet {
        name: required(TF_OUTPUT_SUBNET_NODES)?,
        purpose: SubnetPurpose::Nodes,
    });
    if let Some(internal) = outputs.get(TF_OUTPUT_SUBNET_INTERNAL) {
        status.networks.subnets.push(Subnet {
            name: internal.clone(),
            purpose: SubnetPurpose::Internal,
        });
    }
    if let Some(ips) = outputs.get(TF_OUTPUT_NAT_IPS) {
        status.networks.nat_ips = ips
            .split(',')
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(|ip| NatIp { ip: ip.to_string() })
            .collect();
    }
    if let Some(email) = outputs.get(TF_OUTPUT_SERVICE_ACCOUNT_EMAIL) {
        status.service_account_email = email.clone();
    }
    Ok(status)
}
