//! 测试数据构建
//!
//! 在一个工作单元内创建 患者/检查/系列/实例/存储位置 树。

use crate::models::*;
use crate::store::ArchiveTx;
use pacs_core::models::*;
use pacs_core::utils::generate_dicom_uid;
use pacs_core::{Attributes, PacsError, Result};

/// 检查树中的一个实例
#[derive(Debug, Clone)]
pub struct InstanceNode {
    pub instance_pk: Pk,
    pub locations: Vec<Location>,
}

/// 检查树中的一个系列
#[derive(Debug, Clone)]
pub struct SeriesNode {
    pub series_pk: Pk,
    pub instances: Vec<InstanceNode>,
}

/// 构建完成的检查树
#[derive(Debug, Clone)]
pub struct StudyTree {
    pub patient_pk: Pk,
    pub study_pk: Pk,
    pub series: Vec<SeriesNode>,
}

impl StudyTree {
    pub fn locations(&self) -> Vec<Location> {
        self.series
            .iter()
            .flat_map(|s| s.instances.iter())
            .flat_map(|i| i.locations.iter().cloned())
            .collect()
    }

    pub fn instance_pks(&self) -> Vec<Pk> {
        self.series
            .iter()
            .flat_map(|s| s.instances.iter().map(|i| i.instance_pk))
            .collect()
    }
}

/// 树构建器
pub struct TreeBuilder<'a> {
    tx: &'a mut dyn ArchiveTx,
    storage_id: String,
    object_size: i64,
    counter: u32,
}

impl<'a> TreeBuilder<'a> {
    pub fn new(tx: &'a mut dyn ArchiveTx, storage_id: &str) -> Self {
        Self {
            tx,
            storage_id: storage_id.to_string(),
            object_size: 1024,
            counter: 0,
        }
    }

    pub fn object_size(mut self, size: i64) -> Self {
        self.object_size = size;
        self
    }

    fn next_uid(&mut self, root: &str) -> String {
        self.counter += 1;
        format!("{}.{}", root, self.counter)
    }

    pub async fn patient(&mut self, patient_id: &str) -> Result<Pk> {
        let attrs = Attributes::new().with(pacs_core::attributes::PATIENT_ID, patient_id);
        self.tx.create_patient(&NewPatient::from_attributes(&attrs)?).await
    }

    pub async fn study(&mut self, patient_pk: Pk) -> Result<Pk> {
        let iuid = generate_dicom_uid();
        self.tx.create_study(&NewStudy::new(patient_pk, &iuid)).await
    }

    pub async fn series(&mut self, study_pk: Pk) -> Result<Pk> {
        let iuid = self.next_uid("1.2.826.0.1.3680043.2");
        self.tx.create_series(&NewSeries::new(study_pk, &iuid)).await
    }

    /// 创建实例及其一个存储位置，并把存储ID加入所属检查
    pub async fn instance(&mut self, series_pk: Pk) -> Result<InstanceNode> {
        self.instance_with(series_pk, None, None).await
    }

    /// 以指定拒绝代码创建已被拒绝的实例
    pub async fn rejected_instance(&mut self, series_pk: Pk, rejection_code_pk: Pk) -> Result<InstanceNode> {
        self.instance_with(series_pk, Some(rejection_code_pk), None).await
    }

    /// 创建以指定代码为标题的拒绝说明
    pub async fn rejection_note(&mut self, series_pk: Pk, concept_name_code_pk: Pk) -> Result<InstanceNode> {
        self.instance_with(series_pk, None, Some(concept_name_code_pk)).await
    }

    async fn instance_with(
        &mut self,
        series_pk: Pk,
        rejection_code_pk: Option<Pk>,
        concept_name_code_pk: Option<Pk>,
    ) -> Result<InstanceNode> {
        let sop_iuid = self.next_uid("1.2.826.0.1.3680043.3");
        let mut new_instance = NewInstance::new(series_pk, &sop_iuid, "1.2.840.10008.5.1.4.1.1.2");
        new_instance.rejection_code_pk = rejection_code_pk;
        new_instance.concept_name_code_pk = concept_name_code_pk;
        let instance_pk = self.tx.create_instance(&new_instance).await?;
        let location = self.location(instance_pk, series_pk, &sop_iuid).await?;
        Ok(InstanceNode {
            instance_pk,
            locations: vec![location],
        })
    }

    /// 为已有实例再加一个副本
    pub async fn replica(&mut self, instance_pk: Pk, storage_id: &str) -> Result<Location> {
        let instance = self
            .tx
            .get_instance(instance_pk)
            .await?
            .ok_or_else(|| PacsError::not_found(format!("instance {}", instance_pk)))?;
        let previous = std::mem::replace(&mut self.storage_id, storage_id.to_string());
        let location = self.location(instance_pk, instance.series_pk, &instance.sop_iuid).await;
        self.storage_id = previous;
        location
    }

    async fn location(&mut self, instance_pk: Pk, series_pk: Pk, sop_iuid: &str) -> Result<Location> {
        let path = format!("{}/{}", series_pk, sop_iuid);
        let pk = self
            .tx
            .create_location(&NewLocation::new(instance_pk, &self.storage_id, &path, self.object_size))
            .await?;

        let series = self
            .tx
            .get_series(series_pk)
            .await?
            .ok_or_else(|| PacsError::not_found(format!("series {}", series_pk)))?;
        let study = self
            .tx
            .get_study(series.study_pk)
            .await?
            .ok_or_else(|| PacsError::not_found(format!("study {}", series.study_pk)))?;
        let mut storage_ids = study.storage_ids.clone();
        if storage_ids.add(&self.storage_id) {
            self.tx.set_study_storage_ids(study.pk, &storage_ids).await?;
        }

        self.tx
            .get_location(pk)
            .await?
            .ok_or_else(|| PacsError::not_found(format!("location {}", pk)))
    }

    /// 一个患者、一个检查，`instances_per_series` 描述每个系列的实例数
    pub async fn study_tree(&mut self, patient_id: &str, instances_per_series: &[usize]) -> Result<StudyTree> {
        let patient_pk = self.patient(patient_id).await?;
        self.study_tree_of(patient_pk, instances_per_series).await
    }

    /// 为已有患者再建一个检查树
    pub async fn study_tree_of(&mut self, patient_pk: Pk, instances_per_series: &[usize]) -> Result<StudyTree> {
        let study_pk = self.study(patient_pk).await?;
        let mut series = Vec::with_capacity(instances_per_series.len());
        for &count in instances_per_series {
            let series_pk = self.series(study_pk).await?;
            let mut instances = Vec::with_capacity(count);
            for _ in 0..count {
                instances.push(self.instance(series_pk).await?);
            }
            series.push(SeriesNode { series_pk, instances });
        }
        Ok(StudyTree {
            patient_pk,
            study_pk,
            series,
        })
    }
}
