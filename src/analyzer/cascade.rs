use crate::error::DetectionError;
use image::GrayImage;
use roxmltree::{Document, Node};
use std::path::Path;
use std::str::FromStr;

/// Rectangle of a Haar-like feature in window coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HaarFeature {
    pub rects: Vec<WeightedRect>,
}

/// Split node of a weak classifier tree.
///
/// A child index above zero points at another node, zero or below at leaf
/// `-index`. Stumps are a single node with `left = 0, right = -1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeNode {
    pub feature: usize,
    pub threshold: f32,
    pub left: i32,
    pub right: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeakClassifier {
    pub nodes: Vec<TreeNode>,
    pub leaves: Vec<f32>,
}

impl WeakClassifier {
    /// Walk the tree and return the leaf value it ends on
    fn vote(&self, mut feature_value: impl FnMut(usize) -> f64) -> f32 {
        let mut index = 0usize;
        // Validated trees only point forward, so this visits each node at most once
        for _ in 0..self.nodes.len() {
            let Some(node) = self.nodes.get(index) else {
                break;
            };
            let next = if feature_value(node.feature) < node.threshold as f64 {
                node.left
            } else {
                node.right
            };
            if next <= 0 {
                return self
                    .leaves
                    .get(next.unsigned_abs() as usize)
                    .copied()
                    .unwrap_or(0.0);
            }
            index = next as usize;
        }
        0.0
    }
}

/// A window passes the stage when the summed votes reach `threshold`
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub threshold: f32,
    pub classifiers: Vec<WeakClassifier>,
}

/// Boosted cascade of Haar-like classifiers over a fixed base window.
///
/// Loaded from the XML that `opencv_traincascade` writes, so the pretrained
/// `haarcascade_*.xml` files shipped with OpenCV work unchanged. Tilted
/// features are not supported.
#[derive(Debug, Clone, PartialEq)]
pub struct CascadeModel {
    pub window_width: u32,
    pub window_height: u32,
    pub features: Vec<HaarFeature>,
    pub stages: Vec<Stage>,
}

impl CascadeModel {
    pub fn from_xml_file<P: AsRef<Path>>(path: P) -> Result<Self, DetectionError> {
        let path = path.as_ref();
        let xml = std::fs::read_to_string(path).map_err(|e| DetectionError::Model {
            details: format!("failed to read cascade {}: {}", path.display(), e),
        })?;
        Self::from_xml_str(&xml)
    }

    pub fn from_xml_str(xml: &str) -> Result<Self, DetectionError> {
        let document =
            Document::parse(xml).map_err(|e| model_error(format!("invalid XML: {}", e)))?;
        let cascade = element(document.root_element(), "cascade")
            .map_err(|_| model_error("expected an opencv-cascade-classifier <cascade> element"))?;

        let stage_type = text(element(cascade, "stageType")?);
        if stage_type != "BOOST" {
            return Err(model_error(format!("unsupported stage type {}", stage_type)));
        }
        let feature_type = text(element(cascade, "featureType")?);
        if feature_type != "HAAR" {
            return Err(model_error(format!("unsupported feature type {}", feature_type)));
        }

        let window_width = parse_one(element(cascade, "width")?, "width")?;
        let window_height = parse_one(element(cascade, "height")?, "height")?;

        let features = items(element(cascade, "features")?)
            .enumerate()
            .map(|(index, node)| parse_feature(index, node))
            .collect::<Result<Vec<_>, _>>()?;

        let stages = items(element(cascade, "stages")?)
            .map(parse_stage)
            .collect::<Result<Vec<_>, _>>()?;

        let model = Self {
            window_width,
            window_height,
            features,
            stages,
        };
        model.validate()?;
        Ok(model)
    }

    /// Rectangles must lie inside the base window and every tree must only
    /// reference existing features, nodes and leaves
    pub fn validate(&self) -> Result<(), DetectionError> {
        if self.window_width < 3 || self.window_height < 3 {
            return Err(model_error("cascade window must be at least 3x3"));
        }
        if self.stages.is_empty() {
            return Err(model_error("cascade has no stages"));
        }

        for (index, feature) in self.features.iter().enumerate() {
            if feature.rects.is_empty() {
                return Err(model_error(format!("feature {} has no rectangles", index)));
            }
            for rect in &feature.rects {
                let inside = |start: u32, extent: u32, limit: u32| {
                    extent > 0 && start.checked_add(extent).is_some_and(|end| end <= limit)
                };
                if !inside(rect.x, rect.width, self.window_width)
                    || !inside(rect.y, rect.height, self.window_height)
                {
                    return Err(model_error(format!(
                        "feature {} has a rectangle outside the {}x{} window",
                        index, self.window_width, self.window_height
                    )));
                }
            }
        }

        for (stage_index, stage) in self.stages.iter().enumerate() {
            for classifier in &stage.classifiers {
                if classifier.nodes.is_empty() || classifier.leaves.is_empty() {
                    return Err(model_error(format!(
                        "stage {} has an empty weak classifier",
                        stage_index
                    )));
                }
                for (node_index, node) in classifier.nodes.iter().enumerate() {
                    if node.feature >= self.features.len() {
                        return Err(model_error(format!(
                            "stage {} references missing feature {}",
                            stage_index, node.feature
                        )));
                    }
                    for child in [node.left, node.right] {
                        let valid = if child > 0 {
                            let child = child as usize;
                            child > node_index && child < classifier.nodes.len()
                        } else {
                            (child.unsigned_abs() as usize) < classifier.leaves.len()
                        };
                        if !valid {
                            return Err(model_error(format!(
                                "stage {} has a tree node with invalid child {}",
                                stage_index, child
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Run the cascade on one window placed at `(x, y)` scaled by `scale`.
    ///
    /// Feature responses are normalised by the window's standard deviation
    /// over the base window minus a one pixel border, matching OpenCV, so
    /// trained thresholds apply as-is.
    pub(crate) fn evaluate(&self, integral: &IntegralImage, x: u32, y: u32, scale: f32) -> bool {
        let win_w = (self.window_width as f32 * scale).round() as u32;
        let win_h = (self.window_height as f32 * scale).round() as u32;
        let border = (scale.round() as u32).max(1);
        if win_w <= 2 * border || win_h <= 2 * border {
            return false;
        }

        let (norm_w, norm_h) = (win_w - 2 * border, win_h - 2 * border);
        let pixels = (norm_w as u64 * norm_h as u64) as f64;
        let mean = integral.sum(x + border, y + border, norm_w, norm_h) as f64 / pixels;
        let squared = integral.squared_sum(x + border, y + border, norm_w, norm_h) as f64;
        let variance = squared / pixels - mean * mean;
        let base_area = ((self.window_width - 2) * (self.window_height - 2)) as f64;
        let std_dev = variance.max(0.0).sqrt();
        let norm = if std_dev > 0.0 { base_area * std_dev } else { 1.0 };

        let value_of = |feature: usize| {
            self.features.get(feature).map_or(0.0, |feature| {
                feature_response(feature, integral, x, y, scale, win_w, win_h) / norm
            })
        };

        self.stages.iter().all(|stage| {
            let votes: f32 = stage
                .classifiers
                .iter()
                .map(|classifier| classifier.vote(&value_of))
                .sum();
            votes >= stage.threshold
        })
    }
}

/// Weighted rectangle sums in base-window pixel units
fn feature_response(
    feature: &HaarFeature,
    integral: &IntegralImage,
    x: u32,
    y: u32,
    scale: f32,
    win_w: u32,
    win_h: u32,
) -> f64 {
    feature
        .rects
        .iter()
        .map(|rect| {
            let rx = ((rect.x as f32 * scale).round() as u32).min(win_w - 1);
            let ry = ((rect.y as f32 * scale).round() as u32).min(win_h - 1);
            let rw = ((rect.width as f32 * scale).round() as u32)
                .max(1)
                .min(win_w - rx);
            let rh = ((rect.height as f32 * scale).round() as u32)
                .max(1)
                .min(win_h - ry);
            let mean =
                integral.sum(x + rx, y + ry, rw, rh) as f64 / (rw as u64 * rh as u64) as f64;
            let base_area = rect.width as f64 * rect.height as f64;
            rect.weight as f64 * base_area * mean
        })
        .sum()
}

fn model_error(details: impl Into<String>) -> DetectionError {
    DetectionError::Model {
        details: details.into(),
    }
}

fn element<'a, 'i>(parent: Node<'a, 'i>, name: &str) -> Result<Node<'a, 'i>, DetectionError> {
    parent
        .children()
        .find(|child| child.has_tag_name(name))
        .ok_or_else(|| model_error(format!("missing <{}> element", name)))
}

/// The `<_>` entries of an OpenCV sequence
fn items<'a, 'i>(parent: Node<'a, 'i>) -> impl Iterator<Item = Node<'a, 'i>> {
    parent.children().filter(|child| child.has_tag_name("_"))
}

fn text<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("").trim()
}

fn parse_token<T: FromStr>(token: &str, what: &str) -> Result<T, DetectionError> {
    token
        .parse()
        .map_err(|_| model_error(format!("invalid {} value '{}'", what, token)))
}

fn parse_one<T: FromStr>(node: Node, what: &str) -> Result<T, DetectionError> {
    parse_token(text(node), what)
}

fn parse_feature(index: usize, node: Node) -> Result<HaarFeature, DetectionError> {
    if let Ok(tilted) = element(node, "tilted") {
        if text(tilted) != "0" {
            return Err(model_error(format!(
                "feature {} is tilted, which is not supported",
                index
            )));
        }
    }

    let rects = items(element(node, "rects")?)
        .map(|rect| {
            let tokens: Vec<&str> = text(rect).split_whitespace().collect();
            let [x, y, width, height, weight] = tokens[..] else {
                return Err(model_error(format!(
                    "feature {} rectangle needs 5 values, got {}",
                    index,
                    tokens.len()
                )));
            };
            Ok(WeightedRect {
                x: parse_token(x, "rect x")?,
                y: parse_token(y, "rect y")?,
                width: parse_token(width, "rect width")?,
                height: parse_token(height, "rect height")?,
                weight: parse_token(weight, "rect weight")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(HaarFeature { rects })
}

fn parse_stage(node: Node) -> Result<Stage, DetectionError> {
    let threshold = parse_one(element(node, "stageThreshold")?, "stage threshold")?;
    let classifiers = items(element(node, "weakClassifiers")?)
        .map(parse_weak_classifier)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Stage {
        threshold,
        classifiers,
    })
}

fn parse_weak_classifier(node: Node) -> Result<WeakClassifier, DetectionError> {
    let tokens: Vec<&str> = text(element(node, "internalNodes")?)
        .split_whitespace()
        .collect();
    if tokens.is_empty() || tokens.len() % 4 != 0 {
        return Err(model_error(format!(
            "internal nodes need groups of 4 values, got {}",
            tokens.len()
        )));
    }

    let nodes = tokens
        .chunks_exact(4)
        .map(|chunk| {
            Ok(TreeNode {
                left: parse_token(chunk[0], "left child")?,
                right: parse_token(chunk[1], "right child")?,
                feature: parse_token(chunk[2], "feature index")?,
                threshold: parse_token(chunk[3], "node threshold")?,
            })
        })
        .collect::<Result<Vec<_>, DetectionError>>()?;

    let leaves = text(element(node, "leafValues")?)
        .split_whitespace()
        .map(|token| parse_token(token, "leaf value"))
        .collect::<Result<Vec<f32>, _>>()?;

    Ok(WeakClassifier { nodes, leaves })
}

/// Summed-area tables of pixel values and their squares
pub struct IntegralImage {
    width: u32,
    height: u32,
    sum: Vec<u64>,
    squared: Vec<u64>,
}

impl IntegralImage {
    pub fn new(image: &GrayImage) -> Self {
        let (width, height) = image.dimensions();
        let stride = width as usize + 1;
        let mut sum = vec![0u64; stride * (height as usize + 1)];
        let mut squared = vec![0u64; stride * (height as usize + 1)];

        for y in 0..height as usize {
            let mut row_sum = 0u64;
            let mut row_squared = 0u64;
            for x in 0..width as usize {
                let value = image.get_pixel(x as u32, y as u32).0[0] as u64;
                row_sum += value;
                row_squared += value * value;
                let index = (y + 1) * stride + x + 1;
                sum[index] = sum[index - stride] + row_sum;
                squared[index] = squared[index - stride] + row_squared;
            }
        }

        Self {
            width,
            height,
            sum,
            squared,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn sum(&self, x: u32, y: u32, width: u32, height: u32) -> u64 {
        Self::lookup(&self.sum, self.width, x, y, width, height)
    }

    pub fn squared_sum(&self, x: u32, y: u32, width: u32, height: u32) -> u64 {
        Self::lookup(&self.squared, self.width, x, y, width, height)
    }

    fn lookup(table: &[u64], image_width: u32, x: u32, y: u32, width: u32, height: u32) -> u64 {
        let stride = image_width as usize + 1;
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + width as usize, y0 + height as usize);
        table[y1 * stride + x1] + table[y0 * stride + x0]
            - table[y0 * stride + x1]
            - table[y1 * stride + x0]
    }
}

/// Two-stage cascade in OpenCV's format, tuned to the synthetic face used in
/// tests: a dark eye band over brighter cheeks, then a bright nose bridge
/// between the eyes.
#[cfg(test)]
pub(crate) const TEST_CASCADE_XML: &str = r#"<?xml version="1.0"?>
<opencv_storage>
<cascade type_id="opencv-cascade-classifier"><stageType>BOOST</stageType>
  <featureType>HAAR</featureType>
  <height>24</height>
  <width>24</width>
  <stageParams>
    <maxWeakCount>1</maxWeakCount></stageParams>
  <featureParams>
    <maxCatCount>0</maxCatCount></featureParams>
  <stageNum>2</stageNum>
  <stages>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>5.0000000000000000e-01</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 0 1.0000000149011612e-01</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_>
    <_>
      <maxWeakCount>1</maxWeakCount>
      <stageThreshold>5.0000000000000000e-01</stageThreshold>
      <weakClassifiers>
        <_>
          <internalNodes>
            0 -1 1 1.0000000149011612e-01</internalNodes>
          <leafValues>
            -1. 1.</leafValues></_></weakClassifiers></_></stages>
  <features>
    <_>
      <rects>
        <_>
          3 6 18 4 -1.</_>
        <_>
          3 10 18 4 1.</_></rects></_>
    <_>
      <rects>
        <_>
          3 6 6 4 -1.</_>
        <_>
          9 6 6 4 2.</_>
        <_>
          15 6 6 4 -1.</_></rects></_></features></cascade>
</opencv_storage>
"#;
